//! Append-only history of applied mutations.
//!
//! Rows in `change_records` are only ever inserted; triggers installed with
//! the schema reject `UPDATE` and `DELETE`. Every committed sync writes one
//! [`SyncRun`] and one [`ChangeRecord`] per affected source record inside the
//! same transaction as the data change.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use serde_json::Value;

use crate::checksum::Checksum;
use crate::domain::{RecordKey, ResourceKind};
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "insert" => Ok(ChangeKind::Insert),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(SyncError::Store(format!("unknown change kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Normal,
    DryRun,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Normal => "normal",
            RunMode::DryRun => "dry_run",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Aborted,
    Flagged,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Aborted => "aborted",
            RunOutcome::Flagged => "flagged",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ChangeCounts {
    pub fn total_changes(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

impl fmt::Display for ChangeCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inserted={} updated={} deleted={} unchanged={} skipped={} failed={}",
            self.inserted, self.updated, self.deleted, self.unchanged, self.skipped, self.failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRecord {
    pub id: Option<i64>,
    pub run_id: i64,
    pub kind: ResourceKind,
    pub subject_key: RecordKey,
    pub change: ChangeKind,
    pub previous_checksum: Option<Checksum>,
    pub new_checksum: Option<Checksum>,
    pub old_values: Option<Value>,
    pub new_values: Option<Value>,
    pub recorded_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRun {
    pub id: Option<i64>,
    pub kind: ResourceKind,
    pub mode: RunMode,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub outcome: RunOutcome,
    pub counts: ChangeCounts,
    pub reason: Option<String>,
}

pub struct AuditLog;

impl AuditLog {
    /// Appends one change record and returns its row id.
    pub fn record(conn: &Connection, change: &ChangeRecord) -> Result<i64, SyncError> {
        conn.execute(
            "INSERT INTO change_records (
                run_id, kind, subject_key, change_kind, previous_checksum,
                new_checksum, old_values, new_values, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                change.run_id,
                change.kind.as_str(),
                change.subject_key.as_str(),
                change.change.as_str(),
                change.previous_checksum.as_ref().map(Checksum::as_str),
                change.new_checksum.as_ref().map(Checksum::as_str),
                change.old_values.as_ref().map(Value::to_string),
                change.new_values.as_ref().map(Value::to_string),
                change.recorded_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_run(conn: &Connection, run: &SyncRun) -> Result<i64, SyncError> {
        conn.execute(
            "INSERT INTO sync_runs (
                kind, mode, started_at, finished_at, outcome,
                inserted, updated, deleted, unchanged, skipped, failed, reason
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                run.kind.as_str(),
                run.mode.as_str(),
                run.started_at,
                run.finished_at,
                run.outcome.as_str(),
                run.counts.inserted as i64,
                run.counts.updated as i64,
                run.counts.deleted as i64,
                run.counts.unchanged as i64,
                run.counts.skipped as i64,
                run.counts.failed as i64,
                run.reason,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_run(conn: &Connection, run_id: i64, finished_at: &str) -> Result<(), SyncError> {
        conn.execute(
            "UPDATE sync_runs SET finished_at = ?1 WHERE id = ?2",
            params![finished_at, run_id],
        )?;
        Ok(())
    }

    /// Full history of one record, oldest first.
    pub fn subject_history(
        conn: &Connection,
        kind: ResourceKind,
        key: &RecordKey,
    ) -> Result<Vec<ChangeRecord>, SyncError> {
        Self::query_changes(
            conn,
            "WHERE kind = ?1 AND subject_key = ?2 ORDER BY id ASC",
            params![kind.as_str(), key.as_str()],
        )
    }

    /// Changes recorded within `[from, to]` (RFC 3339 bounds, inclusive).
    pub fn changes_between(
        conn: &Connection,
        from: &str,
        to: &str,
    ) -> Result<Vec<ChangeRecord>, SyncError> {
        Self::query_changes(
            conn,
            "WHERE recorded_at >= ?1 AND recorded_at <= ?2 ORDER BY id ASC",
            params![from, to],
        )
    }

    pub fn changes_for_run(conn: &Connection, run_id: i64) -> Result<Vec<ChangeRecord>, SyncError> {
        Self::query_changes(conn, "WHERE run_id = ?1 ORDER BY id ASC", params![run_id])
    }

    pub fn recent_changes(conn: &Connection, limit: usize) -> Result<Vec<ChangeRecord>, SyncError> {
        Self::query_changes(
            conn,
            "ORDER BY id DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    pub fn run(conn: &Connection, run_id: i64) -> Result<Option<SyncRun>, SyncError> {
        let mut stmt = conn.prepare(&format!("{RUN_COLUMNS} WHERE id = ?1"))?;
        let row = stmt
            .query_row(params![run_id], read_run_row)
            .optional()?;
        row.map(RawRun::into_run).transpose()
    }

    pub fn recent_runs(conn: &Connection, limit: usize) -> Result<Vec<SyncRun>, SyncError> {
        let mut stmt = conn.prepare(&format!("{RUN_COLUMNS} ORDER BY id DESC LIMIT ?1"))?;
        let rows = stmt.query_map(params![limit as i64], read_run_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_run()?);
        }
        Ok(runs)
    }

    fn query_changes(
        conn: &Connection,
        clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<ChangeRecord>, SyncError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, run_id, kind, subject_key, change_kind, previous_checksum,
                    new_checksum, old_values, new_values, recorded_at
             FROM change_records {clause}"
        ))?;
        let rows = stmt.query_map(args, read_change_row)?;
        let mut changes = Vec::new();
        for row in rows {
            changes.push(row?.into_change()?);
        }
        Ok(changes)
    }
}

const RUN_COLUMNS: &str = "SELECT id, kind, mode, started_at, finished_at, outcome,
        inserted, updated, deleted, unchanged, skipped, failed, reason
     FROM sync_runs";

struct RawChange {
    id: i64,
    run_id: i64,
    kind: String,
    subject_key: String,
    change_kind: String,
    previous_checksum: Option<String>,
    new_checksum: Option<String>,
    old_values: Option<String>,
    new_values: Option<String>,
    recorded_at: String,
}

fn read_change_row(row: &Row<'_>) -> rusqlite::Result<RawChange> {
    Ok(RawChange {
        id: row.get(0)?,
        run_id: row.get(1)?,
        kind: row.get(2)?,
        subject_key: row.get(3)?,
        change_kind: row.get(4)?,
        previous_checksum: row.get(5)?,
        new_checksum: row.get(6)?,
        old_values: row.get(7)?,
        new_values: row.get(8)?,
        recorded_at: row.get(9)?,
    })
}

impl RawChange {
    fn into_change(self) -> Result<ChangeRecord, SyncError> {
        Ok(ChangeRecord {
            id: Some(self.id),
            run_id: self.run_id,
            kind: self.kind.parse()?,
            subject_key: self.subject_key.parse()?,
            change: self.change_kind.parse()?,
            previous_checksum: self.previous_checksum.map(Checksum::from_hex),
            new_checksum: self.new_checksum.map(Checksum::from_hex),
            old_values: parse_json(self.old_values)?,
            new_values: parse_json(self.new_values)?,
            recorded_at: self.recorded_at,
        })
    }
}

struct RawRun {
    id: i64,
    kind: String,
    mode: String,
    started_at: String,
    finished_at: Option<String>,
    outcome: String,
    counts: [i64; 6],
    reason: Option<String>,
}

fn read_run_row(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        kind: row.get(1)?,
        mode: row.get(2)?,
        started_at: row.get(3)?,
        finished_at: row.get(4)?,
        outcome: row.get(5)?,
        counts: [
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
            row.get(9)?,
            row.get(10)?,
            row.get(11)?,
        ],
        reason: row.get(12)?,
    })
}

impl RawRun {
    fn into_run(self) -> Result<SyncRun, SyncError> {
        let mode = match self.mode.as_str() {
            "normal" => RunMode::Normal,
            "dry_run" => RunMode::DryRun,
            other => return Err(SyncError::Store(format!("unknown run mode {other}"))),
        };
        let outcome = match self.outcome.as_str() {
            "completed" => RunOutcome::Completed,
            "aborted" => RunOutcome::Aborted,
            "flagged" => RunOutcome::Flagged,
            other => return Err(SyncError::Store(format!("unknown run outcome {other}"))),
        };
        let [inserted, updated, deleted, unchanged, skipped, failed] = self.counts.map(|n| n as usize);
        Ok(SyncRun {
            id: Some(self.id),
            kind: self.kind.parse()?,
            mode,
            started_at: self.started_at,
            finished_at: self.finished_at,
            outcome,
            counts: ChangeCounts {
                inserted,
                updated,
                deleted,
                unchanged,
                skipped,
                failed,
            },
            reason: self.reason,
        })
    }
}

/// Parses an RFC 3339 instant or a bare date into the stored timestamp
/// format. A bare date means the start of that day, or its last microsecond
/// when `end_of_day` is set.
pub fn time_bound(value: &str, end_of_day: bool) -> Result<String, SyncError> {
    let value = value.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Micros, true));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| SyncError::InvalidTime(value.to_string()))?;
    let time = if end_of_day {
        NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| SyncError::InvalidTime(value.to_string()))?;
    Ok(date
        .and_time(time)
        .and_utc()
        .to_rfc3339_opts(SecondsFormat::Micros, true))
}

fn parse_json(value: Option<String>) -> Result<Option<Value>, SyncError> {
    value
        .map(|text| serde_json::from_str(&text).map_err(|err| SyncError::Store(err.to_string())))
        .transpose()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn time_bounds_use_stored_format() {
        assert_eq!(
            time_bound("2024-03-01", false).unwrap(),
            "2024-03-01T00:00:00.000000Z"
        );
        assert_eq!(
            time_bound("2024-03-01", true).unwrap(),
            "2024-03-01T23:59:59.999999Z"
        );
        assert_eq!(
            time_bound("2024-03-01T12:00:00+02:00", false).unwrap(),
            "2024-03-01T10:00:00.000000Z"
        );
        assert_matches!(time_bound("yesterday", false), Err(SyncError::InvalidTime(_)));
    }

    #[test]
    fn counts_display() {
        let counts = ChangeCounts {
            inserted: 2,
            deleted: 1,
            ..ChangeCounts::default()
        };
        assert_eq!(counts.total_changes(), 3);
        assert_eq!(
            counts.to_string(),
            "inserted=2 updated=0 deleted=1 unchanged=0 skipped=0 failed=0"
        );
    }
}
