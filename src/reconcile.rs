//! Change detection between a fresh upstream snapshot and the stored
//! checksums, with a deletion safety check and a transactional commit.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{AuditLog, ChangeCounts, ChangeKind, ChangeRecord, RunMode, RunOutcome, SyncRun};
use crate::domain::{RecordKey, ResourceKind, SourceRecord};
use crate::error::SyncError;
use crate::store::{self, Store, StoredChecksum, iso_timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Ready,
    Flagged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    NotConfirmed,
    Confirmed,
}

impl From<bool> for Confirmation {
    fn from(confirmed: bool) -> Self {
        if confirmed {
            Confirmation::Confirmed
        } else {
            Confirmation::NotConfirmed
        }
    }
}

/// Refuses plans that would delete too large a share of the stored records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyPolicy {
    pub deletion_threshold: f64,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            deletion_threshold: 0.10,
        }
    }
}

impl SafetyPolicy {
    /// A ratio exactly at the threshold still passes.
    pub fn allows(&self, deletion_ratio: f64) -> bool {
        deletion_ratio <= self.deletion_threshold
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedUpdate {
    pub record: SourceRecord,
    pub previous: StoredChecksum,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedDelete {
    pub key: RecordKey,
    pub previous: StoredChecksum,
}

/// Proposed changes for one resource kind. Nothing is applied until
/// [`commit`] succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationPlan {
    pub kind: ResourceKind,
    pub inserts: Vec<SourceRecord>,
    pub updates: Vec<PlannedUpdate>,
    pub deletes: Vec<PlannedDelete>,
    pub unchanged: usize,
    pub skipped: usize,
    pub previous_total: usize,
    pub deletion_ratio: f64,
    pub threshold: f64,
    pub status: PlanStatus,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn is_flagged(&self) -> bool {
        self.status == PlanStatus::Flagged
    }

    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            inserted: self.inserts.len(),
            updated: self.updates.len(),
            deleted: self.deletes.len(),
            unchanged: self.unchanged,
            skipped: self.skipped,
            failed: 0,
        }
    }

    pub fn flagged_error(&self) -> SyncError {
        SyncError::ReconciliationFlagged {
            candidate_deletes: self.deletes.len(),
            previous_total: self.previous_total,
            deletion_ratio: self.deletion_ratio,
            threshold: self.threshold,
            counts: self.counts(),
        }
    }

    /// Every planned mutation in apply order, for previews.
    pub fn changes(&self) -> Vec<(ChangeKind, &RecordKey)> {
        self.inserts
            .iter()
            .map(|record| (ChangeKind::Insert, &record.key))
            .chain(
                self.updates
                    .iter()
                    .map(|update| (ChangeKind::Update, &update.record.key)),
            )
            .chain(
                self.deletes
                    .iter()
                    .map(|delete| (ChangeKind::Delete, &delete.key)),
            )
            .collect()
    }
}

/// Builds the plan that turns `previous` into `fresh`.
///
/// Records whose key appears more than once in `fresh` keep the last
/// occurrence; earlier ones count as skipped. Output lists are key-ordered.
pub fn reconcile(
    kind: ResourceKind,
    fresh: Vec<SourceRecord>,
    previous: &BTreeMap<RecordKey, StoredChecksum>,
    policy: &SafetyPolicy,
) -> ReconciliationPlan {
    let mut skipped = 0usize;
    let mut latest: BTreeMap<RecordKey, SourceRecord> = BTreeMap::new();
    for record in fresh {
        if record.kind != kind {
            warn!(expected = %kind, found = %record.kind, key = %record.key, "ignoring record of another kind");
            skipped += 1;
            continue;
        }
        if let Some(replaced) = latest.insert(record.key.clone(), record) {
            warn!(%kind, key = %replaced.key, "duplicate upstream key, keeping the last entry");
            skipped += 1;
        }
    }

    let mut inserts = Vec::new();
    let mut updates = Vec::new();
    let mut unchanged = 0usize;
    for (key, record) in latest.iter() {
        match previous.get(key) {
            None => inserts.push(record.clone()),
            Some(stored) if is_unchanged(record, stored) => unchanged += 1,
            Some(stored) => updates.push(PlannedUpdate {
                record: record.clone(),
                previous: stored.clone(),
            }),
        }
    }

    let deletes = previous
        .iter()
        .filter(|(key, _)| !latest.contains_key(*key))
        .map(|(key, stored)| PlannedDelete {
            key: key.clone(),
            previous: stored.clone(),
        })
        .collect::<Vec<_>>();

    let previous_total = previous.len();
    let deletion_ratio = if previous_total == 0 {
        0.0
    } else {
        deletes.len() as f64 / previous_total as f64
    };
    let status = if policy.allows(deletion_ratio) {
        PlanStatus::Ready
    } else {
        PlanStatus::Flagged
    };

    ReconciliationPlan {
        kind,
        inserts,
        updates,
        deletes,
        unchanged,
        skipped,
        previous_total,
        deletion_ratio,
        threshold: policy.deletion_threshold,
        status,
    }
}

fn is_unchanged(record: &SourceRecord, stored: &StoredChecksum) -> bool {
    if record.checksum != stored.checksum {
        return false;
    }
    match (&record.last_modified, &stored.last_modified) {
        (Some(fresh), Some(known)) => fresh == known,
        _ => true,
    }
}

/// Applies the plan in one transaction: inserts, then updates, then deletes,
/// each with its change record, under a single sync run.
///
/// A flagged plan is refused unless confirmed. Any failure rolls the whole
/// transaction back and surfaces as [`SyncError::CommitFailure`].
pub fn commit(
    store: &Store,
    plan: &ReconciliationPlan,
    confirmation: Confirmation,
) -> Result<SyncRun, SyncError> {
    if plan.is_flagged() && confirmation != Confirmation::Confirmed {
        return Err(plan.flagged_error());
    }

    let kind = plan.kind;
    let started_at = iso_timestamp();
    let reason = plan.is_flagged().then(|| {
        format!(
            "deletion of {} of {} records confirmed by operator",
            plan.deletes.len(),
            plan.previous_total
        )
    });
    let mut run = SyncRun {
        id: None,
        kind,
        mode: RunMode::Normal,
        started_at: started_at.clone(),
        finished_at: None,
        outcome: RunOutcome::Completed,
        counts: plan.counts(),
        reason,
    };

    let result = store.transaction(|tx| {
        let run_id = AuditLog::insert_run(tx, &run)?;
        let change = |subject_key: &RecordKey, change: ChangeKind| ChangeRecord {
            id: None,
            run_id,
            kind,
            subject_key: subject_key.clone(),
            change,
            previous_checksum: None,
            new_checksum: None,
            old_values: None,
            new_values: None,
            recorded_at: started_at.clone(),
        };

        for record in &plan.inserts {
            store::insert_record(tx, record, &started_at)?;
            AuditLog::record(
                tx,
                &ChangeRecord {
                    new_checksum: Some(record.checksum.clone()),
                    new_values: Some(record.payload.clone()),
                    ..change(&record.key, ChangeKind::Insert)
                },
            )?;
        }
        for update in &plan.updates {
            let old_values =
                store::update_record(tx, &update.record, &update.previous.checksum, &started_at)?;
            AuditLog::record(
                tx,
                &ChangeRecord {
                    previous_checksum: Some(update.previous.checksum.clone()),
                    new_checksum: Some(update.record.checksum.clone()),
                    old_values: Some(old_values),
                    new_values: Some(update.record.payload.clone()),
                    ..change(&update.record.key, ChangeKind::Update)
                },
            )?;
        }
        for delete in &plan.deletes {
            let old_values =
                store::delete_record(tx, kind, &delete.key, &delete.previous.checksum)?;
            AuditLog::record(
                tx,
                &ChangeRecord {
                    previous_checksum: Some(delete.previous.checksum.clone()),
                    old_values: Some(old_values),
                    ..change(&delete.key, ChangeKind::Delete)
                },
            )?;
        }

        let finished_at = iso_timestamp();
        store::set_last_sync(tx, kind, &finished_at)?;
        AuditLog::finish_run(tx, run_id, &finished_at)?;
        Ok((run_id, finished_at))
    });

    match result {
        Ok((run_id, finished_at)) => {
            run.id = Some(run_id);
            run.finished_at = Some(finished_at);
            info!(%kind, run_id, counts = %run.counts, "sync committed");
            Ok(run)
        }
        Err(err) => Err(SyncError::CommitFailure(err.to_string())),
    }
}
