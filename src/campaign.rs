//! Resumable, checkpointed fetching of per-isotherm detail.
//!
//! Candidate keys are processed in sorted order in fixed-size batches. The
//! checkpoint advances only after a whole batch has been handled, so a
//! process killed mid-batch resumes at the start of that batch and never
//! revisits earlier ones.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CampaignSettings;
use crate::domain::RecordKey;
use crate::error::{FetchErrorKind, SyncError};
use crate::fetch::IsodbClient;
use crate::store::{Store, iso_timestamp};

pub const DEFAULT_CAMPAIGN: &str = "isotherm-details";

/// Durable progress marker of one campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub campaign: String,
    /// Last key of the last fully processed batch.
    pub last_key: Option<RecordKey>,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub updated_at: Option<String>,
}

impl Checkpoint {
    pub fn new(campaign: &str) -> Self {
        Self {
            campaign: campaign.to_string(),
            last_key: None,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            updated_at: None,
        }
    }

    pub fn covers(&self, key: &RecordKey) -> bool {
        self.last_key.as_ref().is_some_and(|last| key <= last)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CampaignOptions {
    pub batch_size: usize,
    pub max_batch_failure_rate: f64,
    /// Re-fetch stored isotherms and ignore the checkpoint.
    pub force: bool,
}

impl CampaignOptions {
    pub fn from_settings(settings: &CampaignSettings, force: bool) -> Self {
        Self {
            batch_size: settings.batch_size,
            max_batch_failure_rate: settings.max_batch_failure_rate,
            force,
        }
    }
}

impl Default for CampaignOptions {
    fn default() -> Self {
        Self::from_settings(&CampaignSettings::default(), false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordFailure {
    pub key: RecordKey,
    pub kind: FetchErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignResult {
    pub campaign: String,
    pub candidates: usize,
    /// Keys at or before the checkpoint marker.
    pub skipped_checkpoint: usize,
    /// Keys whose detail was already stored.
    pub skipped_fresh: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub batches: usize,
    pub failures: Vec<RecordFailure>,
    pub checkpoint: Checkpoint,
}

pub struct BatchFetcher<'a, C: IsodbClient> {
    store: &'a Store,
    client: &'a C,
}

impl<'a, C: IsodbClient> BatchFetcher<'a, C> {
    pub fn new(store: &'a Store, client: &'a C) -> Self {
        Self { store, client }
    }

    pub fn run_campaign(
        &self,
        campaign: &str,
        candidates: Vec<RecordKey>,
        options: &CampaignOptions,
    ) -> Result<CampaignResult, SyncError> {
        if options.batch_size == 0 {
            return Err(SyncError::InvalidConfig(
                "campaign batch size must be at least 1".to_string(),
            ));
        }

        let mut keys = candidates;
        keys.sort();
        keys.dedup();
        let candidate_count = keys.len();

        let mut checkpoint = self
            .store
            .load_checkpoint(campaign)?
            .unwrap_or_else(|| Checkpoint::new(campaign));
        let skipped_checkpoint = if options.force {
            0
        } else {
            let before = keys.len();
            keys.retain(|key| !checkpoint.covers(key));
            before - keys.len()
        };
        info!(
            campaign,
            candidates = candidate_count,
            pending = keys.len(),
            resume_after = checkpoint.last_key.as_ref().map(RecordKey::as_str),
            "campaign started"
        );

        let mut result = CampaignResult {
            campaign: campaign.to_string(),
            candidates: candidate_count,
            skipped_checkpoint,
            skipped_fresh: 0,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            batches: 0,
            failures: Vec::new(),
            checkpoint: checkpoint.clone(),
        };

        for (index, batch) in keys.chunks(options.batch_size).enumerate() {
            let mut attempted = 0usize;
            let mut failed = 0usize;
            let mut succeeded = 0usize;

            for key in batch {
                if !options.force && self.store.has_isotherm_detail(key)? {
                    debug!(campaign, %key, "detail already stored");
                    result.skipped_fresh += 1;
                    continue;
                }
                attempted += 1;
                match self.client.fetch_isotherm(key) {
                    Ok(detail) => {
                        self.store.save_isotherm_detail(&detail)?;
                        succeeded += 1;
                    }
                    Err(err) => {
                        let failure = record_failure(key, err)?;
                        warn!(campaign, %key, kind = %failure.kind, error = %failure.message, "isotherm fetch failed");
                        self.store.record_campaign_failure(campaign, &failure)?;
                        result.failures.push(failure);
                        failed += 1;
                    }
                }
            }

            result.attempted += attempted;
            result.succeeded += succeeded;
            result.failed += failed;
            result.batches += 1;

            let rate = if attempted == 0 {
                0.0
            } else {
                failed as f64 / attempted as f64
            };
            if rate > options.max_batch_failure_rate {
                warn!(campaign, batch = index, attempted, failed, "campaign aborted");
                return Err(SyncError::CampaignAborted {
                    campaign: campaign.to_string(),
                    batch: index,
                    attempted,
                    failed,
                    succeeded: checkpoint.succeeded + succeeded as u64,
                    max_rate: options.max_batch_failure_rate,
                });
            }

            if let Some(last) = batch.last() {
                checkpoint.last_key = Some(last.clone());
            }
            checkpoint.attempted += attempted as u64;
            checkpoint.succeeded += succeeded as u64;
            checkpoint.failed += failed as u64;
            checkpoint.updated_at = Some(iso_timestamp());
            self.store.save_checkpoint(&checkpoint)?;
            debug!(campaign, batch = index, attempted, succeeded, failed, "batch checkpointed");
        }

        info!(
            campaign,
            attempted = result.attempted,
            succeeded = result.succeeded,
            failed = result.failed,
            "campaign finished"
        );
        result.checkpoint = checkpoint;
        Ok(result)
    }
}

/// Fetch-stage errors become per-record failures; anything else aborts.
fn record_failure(key: &RecordKey, err: SyncError) -> Result<RecordFailure, SyncError> {
    let kind = match &err {
        SyncError::Fetch(fetch) => fetch.kind,
        SyncError::Payload(_) | SyncError::InvalidKey(_) => FetchErrorKind::Fatal,
        _ => return Err(err),
    };
    Ok(RecordFailure {
        key: key.clone(),
        kind,
        message: err.to_string(),
    })
}
