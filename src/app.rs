use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::audit::{ChangeCounts, ChangeKind, ChangeRecord, RunMode, RunOutcome, SyncRun, time_bound};
use crate::campaign::{BatchFetcher, CampaignOptions, CampaignResult, Checkpoint};
use crate::config::{CampaignSettings, ResolvedConfig};
use crate::domain::{RecordKey, ResourceKind, SourceRecord};
use crate::error::SyncError;
use crate::fetch::IsodbClient;
use crate::normalize::{NormalizationStats, Normalizer};
use crate::reconcile::{
    Confirmation, PlanStatus, ReconciliationPlan, SafetyPolicy, commit, reconcile,
};
use crate::records::isotherm_counts;
use crate::store::{KindStatus, Store, iso_timestamp};

const ISOTHERM_COUNT_FIELD: &str = "isotherm_count";

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub confirm_deletions: bool,
    pub skip_isotherm_counts: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedChange {
    pub change: ChangeKind,
    pub key: RecordKey,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub kind: ResourceKind,
    pub mode: RunMode,
    pub outcome: RunOutcome,
    pub run_id: Option<i64>,
    pub status: PlanStatus,
    pub counts: ChangeCounts,
    pub previous_total: usize,
    pub deletion_ratio: f64,
    pub threshold: f64,
    pub upstream_last_modified: Option<String>,
    /// Planned mutations; only filled for dry runs.
    pub changes: Vec<PlannedChange>,
}

impl SyncReport {
    fn from_plan(plan: &ReconciliationPlan, mode: RunMode, last_modified: Option<String>) -> Self {
        let outcome = if plan.is_flagged() && mode == RunMode::DryRun {
            RunOutcome::Flagged
        } else {
            RunOutcome::Completed
        };
        let changes = match mode {
            RunMode::DryRun => plan
                .changes()
                .into_iter()
                .map(|(change, key)| PlannedChange {
                    change,
                    key: key.clone(),
                })
                .collect(),
            RunMode::Normal => Vec::new(),
        };
        Self {
            kind: plan.kind,
            mode,
            outcome,
            run_id: None,
            status: plan.status,
            counts: plan.counts(),
            previous_total: plan.previous_total,
            deletion_ratio: plan.deletion_ratio,
            threshold: plan.threshold,
            upstream_last_modified: last_modified,
            changes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub database: Option<String>,
    pub kinds: Vec<KindStatus>,
    pub isotherm_details: usize,
    pub raw_points: usize,
    pub checkpoints: Vec<Checkpoint>,
    pub recent_runs: Vec<SyncRun>,
    /// Only filled for verbose status.
    pub recent_changes: Vec<ChangeRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditResult {
    pub changes: Vec<ChangeRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    pub run: SyncRun,
    pub changes: Vec<ChangeRecord>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<C: IsodbClient> {
    store: Store,
    client: C,
    policy: SafetyPolicy,
    campaign: CampaignSettings,
    normalizer: Normalizer,
}

impl<C: IsodbClient> App<C> {
    pub fn new(store: Store, client: C) -> Self {
        Self {
            store,
            client,
            policy: SafetyPolicy::default(),
            campaign: CampaignSettings::default(),
            normalizer: Normalizer::default(),
        }
    }

    pub fn from_config(store: Store, client: C, config: &ResolvedConfig, normalizer: Normalizer) -> Self {
        Self {
            store,
            client,
            policy: SafetyPolicy {
                deletion_threshold: config.deletion_threshold,
            },
            campaign: config.campaign,
            normalizer,
        }
    }

    pub fn with_policy(mut self, policy: SafetyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_campaign_settings(mut self, settings: CampaignSettings) -> Self {
        self.campaign = settings;
        self
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// Fetches one resource kind, plans the changes against the store and,
    /// unless this is a dry run, commits them.
    pub fn sync(
        &self,
        kind: ResourceKind,
        options: SyncOptions,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport, SyncError> {
        sink.event(ProgressEvent {
            message: format!("phase=Fetch; {kind}"),
            elapsed: None,
        });
        let started = Instant::now();
        let batch = self.client.fetch(kind)?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Fetch; {} {kind} records, {} without key",
                batch.records.len(),
                batch.skipped
            ),
            elapsed: Some(started.elapsed()),
        });

        let mut records = batch.records;
        if kind == ResourceKind::Materials {
            self.apply_isotherm_counts(&mut records, options.skip_isotherm_counts, sink)?;
        }

        let previous = self.store.checksums(kind)?;
        let mut plan = reconcile(kind, records, &previous, &self.policy);
        plan.skipped += batch.skipped;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Plan; {} (deletion ratio {:.3})",
                plan.counts(),
                plan.deletion_ratio
            ),
            elapsed: Some(started.elapsed()),
        });

        if options.dry_run {
            info!(%kind, counts = %plan.counts(), flagged = plan.is_flagged(), "dry run, nothing written");
            return Ok(SyncReport::from_plan(
                &plan,
                RunMode::DryRun,
                batch.last_modified,
            ));
        }

        if plan.is_flagged() && !options.confirm_deletions {
            let err = plan.flagged_error();
            self.record_unapplied_run(&plan, RunOutcome::Flagged, err.to_string());
            warn!(%kind, deletes = plan.deletes.len(), previous = plan.previous_total, "plan flagged, awaiting confirmation");
            return Err(err);
        }

        sink.event(ProgressEvent {
            message: format!("phase=Commit; {kind}"),
            elapsed: Some(started.elapsed()),
        });
        let run = match commit(
            &self.store,
            &plan,
            Confirmation::from(options.confirm_deletions),
        ) {
            Ok(run) => run,
            Err(err) => {
                self.record_unapplied_run(&plan, RunOutcome::Aborted, err.to_string());
                return Err(err);
            }
        };
        sink.event(ProgressEvent {
            message: format!("phase=Done; {kind} {}", run.counts),
            elapsed: Some(started.elapsed()),
        });

        let mut report = SyncReport::from_plan(&plan, RunMode::Normal, batch.last_modified);
        report.run_id = run.id;
        Ok(report)
    }

    /// Syncs every resource kind in order, stopping at the first failure.
    pub fn sync_all(
        &self,
        options: SyncOptions,
        sink: &dyn ProgressSink,
    ) -> Result<Vec<SyncReport>, SyncError> {
        ResourceKind::ALL
            .iter()
            .map(|kind| self.sync(*kind, options, sink))
            .collect()
    }

    fn record_unapplied_run(&self, plan: &ReconciliationPlan, outcome: RunOutcome, reason: String) {
        let now = iso_timestamp();
        let run = SyncRun {
            id: None,
            kind: plan.kind,
            mode: RunMode::Normal,
            started_at: now.clone(),
            finished_at: Some(now),
            outcome,
            counts: plan.counts(),
            reason: Some(reason),
        };
        if let Err(err) = self.store.record_run(&run) {
            warn!(kind = %plan.kind, error = %err, "failed to record sync run");
        }
    }

    /// Sets `isotherm_count` on material payloads from the isotherm listing.
    /// When counts are skipped or the listing fails, stored counts carry
    /// forward so the field does not churn.
    fn apply_isotherm_counts(
        &self,
        records: &mut [SourceRecord],
        skip: bool,
        sink: &dyn ProgressSink,
    ) -> Result<(), SyncError> {
        let counts = if skip {
            None
        } else {
            sink.event(ProgressEvent {
                message: "phase=Fetch; isotherm counts".to_string(),
                elapsed: None,
            });
            match self.client.fetch_isotherm_index() {
                Ok(index) => Some(isotherm_counts(&index)),
                Err(err) => {
                    warn!(error = %err, "isotherm counts unavailable, keeping stored counts");
                    None
                }
            }
        };

        match counts {
            Some(counts) => {
                for record in records.iter_mut() {
                    let count = lookup_count(&counts, record);
                    record.set_field(ISOTHERM_COUNT_FIELD, json!(count))?;
                }
            }
            None => {
                for record in records.iter_mut() {
                    let stored = self
                        .store
                        .record(ResourceKind::Materials, &record.key)?
                        .and_then(|stored| stored.payload.get(ISOTHERM_COUNT_FIELD).cloned());
                    if let Some(count) = stored {
                        record.set_field(ISOTHERM_COUNT_FIELD, count)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetches isotherm detail for `keys`, or for every stored isotherm.
    pub fn run_campaign(
        &self,
        name: &str,
        keys: Option<Vec<RecordKey>>,
        options: CampaignOptions,
        sink: &dyn ProgressSink,
    ) -> Result<CampaignResult, SyncError> {
        let keys = match keys {
            Some(keys) => keys,
            None => self.store.record_keys(ResourceKind::Isotherms)?,
        };
        sink.event(ProgressEvent {
            message: format!("phase=Campaign; {name}: {} candidates", keys.len()),
            elapsed: None,
        });
        let started = Instant::now();
        let result = BatchFetcher::new(&self.store, &self.client).run_campaign(name, keys, &options)?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; {} succeeded, {} failed, {} already stored",
                result.succeeded, result.failed, result.skipped_fresh
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(result)
    }

    pub fn campaign_options(&self, batch_size: Option<usize>, force: bool) -> CampaignOptions {
        let mut options = CampaignOptions::from_settings(&self.campaign, force);
        if let Some(batch_size) = batch_size {
            options.batch_size = batch_size;
        }
        options
    }

    pub fn normalize(&self, sink: &dyn ProgressSink) -> Result<NormalizationStats, SyncError> {
        sink.event(ProgressEvent {
            message: "phase=Normalize; rebuilding normalized points".to_string(),
            elapsed: None,
        });
        let started = Instant::now();
        let stats = self.normalizer.renormalize(&self.store)?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; {} of {} points fully normalized",
                stats.fully_normalized, stats.total_points
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(stats)
    }

    pub fn normalization_stats(&self) -> Result<NormalizationStats, SyncError> {
        self.store.normalization_stats()
    }

    pub fn status(&self, verbose: bool) -> Result<StatusReport, SyncError> {
        Ok(StatusReport {
            database: self.store.path().map(|path| path.to_string()),
            kinds: self.store.status()?,
            isotherm_details: self.store.isotherm_detail_count()?,
            raw_points: self.store.point_count()?,
            checkpoints: self.store.checkpoints()?,
            recent_runs: self.store.recent_runs(if verbose { 20 } else { 5 })?,
            recent_changes: if verbose {
                self.store.recent_changes(20)?
            } else {
                Vec::new()
            },
        })
    }

    pub fn history(&self, kind: ResourceKind, key: &RecordKey) -> Result<AuditResult, SyncError> {
        Ok(AuditResult {
            changes: self.store.subject_history(kind, key)?,
        })
    }

    /// Changes between two bounds given as RFC 3339 instants or dates.
    pub fn changes_between(&self, from: &str, to: &str) -> Result<AuditResult, SyncError> {
        let from = time_bound(from, false)?;
        let to = time_bound(to, true)?;
        Ok(AuditResult {
            changes: self.store.changes_between(&from, &to)?,
        })
    }

    pub fn run_detail(&self, run_id: i64) -> Result<RunDetail, SyncError> {
        let run = self
            .store
            .run(run_id)?
            .ok_or(SyncError::RunNotFound(run_id))?;
        Ok(RunDetail {
            run,
            changes: self.store.changes_for_run(run_id)?,
        })
    }
}

fn lookup_count(counts: &BTreeMap<String, u64>, record: &SourceRecord) -> u64 {
    counts
        .get(record.key.as_str())
        .or_else(|| {
            record
                .payload
                .get("name")
                .and_then(Value::as_str)
                .and_then(|name| counts.get(name))
        })
        .copied()
        .unwrap_or(0)
}
