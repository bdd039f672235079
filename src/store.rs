use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::Serialize;
use serde_json::Value;

use crate::audit::{AuditLog, ChangeRecord, SyncRun};
use crate::campaign::{Checkpoint, RecordFailure};
use crate::checksum::Checksum;
use crate::domain::{RecordKey, ResourceKind, SourceRecord};
use crate::error::SyncError;
use crate::normalize::{NormalizationStats, NormalizedPoint, UnitContext};
use crate::records::{IsothermDetail, RawPoint};

const SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// RFC 3339 UTC with fixed microsecond precision, so stored timestamps sort
/// lexically in time order.
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Previously stored checksum of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChecksum {
    pub checksum: Checksum,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub kind: ResourceKind,
    pub key: RecordKey,
    pub payload: Value,
    pub last_modified: Option<String>,
    pub checksum: Checksum,
    pub local_updated: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindStatus {
    pub kind: ResourceKind,
    pub records: usize,
    pub last_sync: Option<String>,
}

/// Raw point joined with the unit context of its isotherm.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPoint {
    pub id: i64,
    pub filename: RecordKey,
    pub seq: usize,
    pub point: RawPoint,
    pub context: UnitContext,
}

/// SQLite-backed local mirror: source records, audit trail, campaign state
/// and isotherm points.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: Option<Utf8PathBuf>,
}

impl Store {
    pub fn open(path: &Utf8Path) -> Result<Self, SyncError> {
        if let Some(parent) = path.parent() {
            if !parent.as_str().is_empty() {
                fs::create_dir_all(parent.as_std_path())
                    .map_err(|err| SyncError::Filesystem(err.to_string()))?;
            }
        }
        let mut conn = Connection::open(path.as_std_path())?;
        apply_pragmas(&conn, true)?;
        initialize_schema(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self, SyncError> {
        let mut conn = Connection::open_in_memory()?;
        apply_pragmas(&conn, false)?;
        initialize_schema(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SyncError> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Store("store connection lock poisoned".to_string()))
    }

    /// Runs `f` inside one transaction. Any error rolls everything back.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, SyncError>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn read<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&Connection) -> Result<T, SyncError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    pub fn checksums(
        &self,
        kind: ResourceKind,
    ) -> Result<BTreeMap<RecordKey, StoredChecksum>, SyncError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, checksum, last_modified FROM source_records WHERE kind = ?1",
            )?;
            let rows = stmt.query_map(params![kind.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            let mut checksums = BTreeMap::new();
            for row in rows {
                let (key, checksum, last_modified) = row?;
                checksums.insert(
                    key.parse()?,
                    StoredChecksum {
                        checksum: Checksum::from_hex(checksum),
                        last_modified,
                    },
                );
            }
            Ok(checksums)
        })
    }

    pub fn record(
        &self,
        kind: ResourceKind,
        key: &RecordKey,
    ) -> Result<Option<StoredRecord>, SyncError> {
        self.read(|conn| {
            let row = conn
                .query_row(
                    "SELECT payload, last_modified, checksum, local_updated
                     FROM source_records WHERE kind = ?1 AND key = ?2",
                    params![kind.as_str(), key.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(payload, last_modified, checksum, local_updated)| {
                Ok(StoredRecord {
                    kind,
                    key: key.clone(),
                    payload: parse_payload(&payload)?,
                    last_modified,
                    checksum: Checksum::from_hex(checksum),
                    local_updated,
                })
            })
            .transpose()
        })
    }

    pub fn record_keys(&self, kind: ResourceKind) -> Result<Vec<RecordKey>, SyncError> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT key FROM source_records WHERE kind = ?1 ORDER BY key")?;
            let rows = stmt.query_map(params![kind.as_str()], |row| row.get::<_, String>(0))?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?.parse()?);
            }
            Ok(keys)
        })
    }

    pub fn record_count(&self, kind: ResourceKind) -> Result<usize, SyncError> {
        self.read(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM source_records WHERE kind = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    pub fn last_sync(&self, kind: ResourceKind) -> Result<Option<String>, SyncError> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM sync_metadata WHERE key = ?1",
                    params![last_sync_key(kind)],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn status(&self) -> Result<Vec<KindStatus>, SyncError> {
        ResourceKind::ALL
            .iter()
            .map(|kind| {
                Ok(KindStatus {
                    kind: *kind,
                    records: self.record_count(*kind)?,
                    last_sync: self.last_sync(*kind)?,
                })
            })
            .collect()
    }

    /// Persists a run that applied no changes (flagged or aborted).
    pub fn record_run(&self, run: &SyncRun) -> Result<i64, SyncError> {
        self.read(|conn| AuditLog::insert_run(conn, run))
    }

    pub fn subject_history(
        &self,
        kind: ResourceKind,
        key: &RecordKey,
    ) -> Result<Vec<ChangeRecord>, SyncError> {
        self.read(|conn| AuditLog::subject_history(conn, kind, key))
    }

    pub fn changes_between(&self, from: &str, to: &str) -> Result<Vec<ChangeRecord>, SyncError> {
        self.read(|conn| AuditLog::changes_between(conn, from, to))
    }

    pub fn changes_for_run(&self, run_id: i64) -> Result<Vec<ChangeRecord>, SyncError> {
        self.read(|conn| AuditLog::changes_for_run(conn, run_id))
    }

    pub fn recent_changes(&self, limit: usize) -> Result<Vec<ChangeRecord>, SyncError> {
        self.read(|conn| AuditLog::recent_changes(conn, limit))
    }

    pub fn run(&self, run_id: i64) -> Result<Option<SyncRun>, SyncError> {
        self.read(|conn| AuditLog::run(conn, run_id))
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>, SyncError> {
        self.read(|conn| AuditLog::recent_runs(conn, limit))
    }

    pub fn load_checkpoint(&self, campaign: &str) -> Result<Option<Checkpoint>, SyncError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!("{CHECKPOINT_COLUMNS} WHERE campaign = ?1"))?;
            let row = stmt.query_row(params![campaign], read_checkpoint).optional()?;
            row.map(RawCheckpoint::into_checkpoint).transpose()
        })
    }

    pub fn checkpoints(&self) -> Result<Vec<Checkpoint>, SyncError> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!("{CHECKPOINT_COLUMNS} ORDER BY campaign"))?;
            let rows = stmt.query_map([], read_checkpoint)?;
            let mut checkpoints = Vec::new();
            for row in rows {
                checkpoints.push(row?.into_checkpoint()?);
            }
            Ok(checkpoints)
        })
    }

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), SyncError> {
        self.read(|conn| {
            conn.execute(
                "INSERT INTO checkpoints (campaign, last_key, attempted, succeeded, failed, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(campaign) DO UPDATE SET
                    last_key = excluded.last_key,
                    attempted = excluded.attempted,
                    succeeded = excluded.succeeded,
                    failed = excluded.failed,
                    updated_at = excluded.updated_at",
                params![
                    checkpoint.campaign,
                    checkpoint.last_key.as_ref().map(RecordKey::as_str),
                    checkpoint.attempted as i64,
                    checkpoint.succeeded as i64,
                    checkpoint.failed as i64,
                    iso_timestamp(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn record_campaign_failure(
        &self,
        campaign: &str,
        failure: &RecordFailure,
    ) -> Result<(), SyncError> {
        self.read(|conn| {
            conn.execute(
                "INSERT INTO campaign_failures (campaign, key, error_kind, message, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    campaign,
                    failure.key.as_str(),
                    failure.kind.to_string(),
                    failure.message,
                    iso_timestamp(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn campaign_failure_count(&self, campaign: &str) -> Result<usize, SyncError> {
        self.read(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM campaign_failures WHERE campaign = ?1",
                params![campaign],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    pub fn has_isotherm_detail(&self, filename: &RecordKey) -> Result<bool, SyncError> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM isotherm_details WHERE filename = ?1",
                    params![filename.as_str()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })
    }

    /// Stores one isotherm's unit context and points, replacing any earlier
    /// copy of the same isotherm.
    pub fn save_isotherm_detail(&self, detail: &IsothermDetail) -> Result<(), SyncError> {
        let adsorbates = serde_json::to_string(&detail.adsorbates)
            .map_err(|err| SyncError::Payload(err.to_string()))?;
        self.transaction(|tx| {
            tx.execute(
                "DELETE FROM isotherm_points WHERE filename = ?1",
                params![detail.filename.as_str()],
            )?;
            tx.execute(
                "INSERT INTO isotherm_details (
                    filename, pressure_units, adsorption_units, adsorbates,
                    temperature, point_count, fetched_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(filename) DO UPDATE SET
                    pressure_units = excluded.pressure_units,
                    adsorption_units = excluded.adsorption_units,
                    adsorbates = excluded.adsorbates,
                    temperature = excluded.temperature,
                    point_count = excluded.point_count,
                    fetched_at = excluded.fetched_at",
                params![
                    detail.filename.as_str(),
                    detail.pressure_units,
                    detail.adsorption_units,
                    adsorbates,
                    detail.temperature,
                    detail.points.len() as i64,
                    iso_timestamp(),
                ],
            )?;
            let mut insert = tx.prepare(
                "INSERT INTO isotherm_points (filename, seq, pressure, total_adsorption, species_data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (seq, point) in detail.points.iter().enumerate() {
                let species = match &point.species_data {
                    Value::Null => None,
                    other => Some(other.to_string()),
                };
                insert.execute(params![
                    detail.filename.as_str(),
                    seq as i64,
                    point.pressure,
                    point.total_adsorption,
                    species,
                ])?;
            }
            Ok(())
        })
    }

    pub fn isotherm_detail_count(&self) -> Result<usize, SyncError> {
        self.count("SELECT COUNT(*) FROM isotherm_details")
    }

    pub fn point_count(&self) -> Result<usize, SyncError> {
        self.count("SELECT COUNT(*) FROM isotherm_points")
    }

    fn count(&self, sql: &str) -> Result<usize, SyncError> {
        self.read(|conn| {
            let count: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    /// Recomputes every normalized point from the raw points in one
    /// transaction. Raw rows are only read.
    pub fn rebuild_normalized<F>(&self, mut normalize: F) -> Result<usize, SyncError>
    where
        F: FnMut(&StoredPoint) -> NormalizedPoint,
    {
        let computed_at = iso_timestamp();
        self.transaction(|tx| {
            tx.execute("DELETE FROM normalized_points", [])?;
            let mut select = tx.prepare(
                "SELECT p.id, p.filename, p.seq, p.pressure, p.total_adsorption, p.species_data,
                        d.pressure_units, d.adsorption_units, d.adsorbates
                 FROM isotherm_points p
                 JOIN isotherm_details d ON d.filename = p.filename
                 ORDER BY p.filename, p.seq",
            )?;
            let mut insert = tx.prepare(
                "INSERT INTO normalized_points (
                    point_id, filename,
                    pressure_value, pressure_unit, pressure_pa, pressure_reason,
                    adsorption_value, adsorption_unit, adsorption_mol_per_kg, adsorption_reason,
                    computed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            let mut rows = select.query([])?;
            let mut written = 0usize;
            while let Some(row) = rows.next()? {
                let species: Option<String> = row.get(5)?;
                let adsorbates: String = row.get(8)?;
                let point = StoredPoint {
                    id: row.get(0)?,
                    filename: row.get::<_, String>(1)?.parse()?,
                    seq: row.get::<_, i64>(2)? as usize,
                    point: RawPoint {
                        pressure: row.get(3)?,
                        total_adsorption: row.get(4)?,
                        species_data: species
                            .as_deref()
                            .map(parse_payload)
                            .transpose()?
                            .unwrap_or(Value::Null),
                    },
                    context: UnitContext {
                        pressure_unit: row.get(6)?,
                        adsorption_unit: row.get(7)?,
                        adsorbates: serde_json::from_str(&adsorbates)
                            .map_err(|err| SyncError::Store(err.to_string()))?,
                    },
                };
                let normalized = normalize(&point);
                insert.execute(params![
                    point.id,
                    point.filename.as_str(),
                    normalized.pressure.original_value,
                    normalized.pressure.original_unit,
                    normalized.pressure.value,
                    normalized.pressure.reason.map(|reason| reason.as_str()),
                    normalized.adsorption.original_value,
                    normalized.adsorption.original_unit,
                    normalized.adsorption.value,
                    normalized.adsorption.reason.map(|reason| reason.as_str()),
                    computed_at,
                ])?;
                written += 1;
            }
            Ok(written)
        })
    }

    pub fn normalization_stats(&self) -> Result<NormalizationStats, SyncError> {
        self.read(|conn| {
            let (total, pressure_converted, adsorption_converted, fully_normalized) = conn
                .query_row(
                    "SELECT COUNT(*),
                            COUNT(pressure_pa),
                            COUNT(adsorption_mol_per_kg),
                            COALESCE(SUM(pressure_pa IS NOT NULL AND adsorption_mol_per_kg IS NOT NULL), 0)
                     FROM normalized_points",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )?;
            Ok(NormalizationStats {
                total_points: total as usize,
                pressure_converted: pressure_converted as usize,
                adsorption_converted: adsorption_converted as usize,
                fully_normalized: fully_normalized as usize,
                pressure_reasons: grouped_counts(
                    conn,
                    "SELECT pressure_reason, COUNT(*) FROM normalized_points
                     WHERE pressure_reason IS NOT NULL GROUP BY pressure_reason",
                )?,
                adsorption_reasons: grouped_counts(
                    conn,
                    "SELECT adsorption_reason, COUNT(*) FROM normalized_points
                     WHERE adsorption_reason IS NOT NULL GROUP BY adsorption_reason",
                )?,
                pressure_units: grouped_counts(
                    conn,
                    "SELECT COALESCE(pressure_units, '(none)'), COUNT(*) FROM isotherm_details
                     GROUP BY 1",
                )?,
                adsorption_units: grouped_counts(
                    conn,
                    "SELECT COALESCE(adsorption_units, '(none)'), COUNT(*) FROM isotherm_details
                     GROUP BY 1",
                )?,
            })
        })
    }
}

/// Inserts a record that must not exist yet.
pub(crate) fn insert_record(
    conn: &Connection,
    record: &SourceRecord,
    now: &str,
) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO source_records (kind, key, payload, last_modified, checksum, local_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.kind.as_str(),
            record.key.as_str(),
            record.payload.to_string(),
            record.last_modified,
            record.checksum.as_str(),
            now,
        ],
    )?;
    Ok(())
}

/// Replaces a record whose stored checksum still equals `expected`. Returns
/// the replaced payload.
pub(crate) fn update_record(
    conn: &Connection,
    record: &SourceRecord,
    expected: &Checksum,
    now: &str,
) -> Result<Value, SyncError> {
    let previous = guarded_payload(conn, record.kind, &record.key, expected)?;
    let changed = conn.execute(
        "UPDATE source_records
         SET payload = ?1, last_modified = ?2, checksum = ?3, local_updated = ?4
         WHERE kind = ?5 AND key = ?6 AND checksum = ?7",
        params![
            record.payload.to_string(),
            record.last_modified,
            record.checksum.as_str(),
            now,
            record.kind.as_str(),
            record.key.as_str(),
            expected.as_str(),
        ],
    )?;
    expect_one_row(changed, record.kind, &record.key)?;
    Ok(previous)
}

/// Removes a record whose stored checksum still equals `expected`. Returns
/// the removed payload.
pub(crate) fn delete_record(
    conn: &Connection,
    kind: ResourceKind,
    key: &RecordKey,
    expected: &Checksum,
) -> Result<Value, SyncError> {
    let previous = guarded_payload(conn, kind, key, expected)?;
    let changed = conn.execute(
        "DELETE FROM source_records WHERE kind = ?1 AND key = ?2 AND checksum = ?3",
        params![kind.as_str(), key.as_str(), expected.as_str()],
    )?;
    expect_one_row(changed, kind, key)?;
    Ok(previous)
}

pub(crate) fn set_last_sync(conn: &Connection, kind: ResourceKind, at: &str) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO sync_metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![last_sync_key(kind), at],
    )?;
    Ok(())
}

fn guarded_payload(
    conn: &Connection,
    kind: ResourceKind,
    key: &RecordKey,
    expected: &Checksum,
) -> Result<Value, SyncError> {
    let payload: Option<String> = conn
        .query_row(
            "SELECT payload FROM source_records WHERE kind = ?1 AND key = ?2 AND checksum = ?3",
            params![kind.as_str(), key.as_str(), expected.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    match payload {
        Some(payload) => parse_payload(&payload),
        None => Err(SyncError::Store(format!(
            "{kind} record {key} changed since the plan was built"
        ))),
    }
}

fn expect_one_row(changed: usize, kind: ResourceKind, key: &RecordKey) -> Result<(), SyncError> {
    if changed != 1 {
        return Err(SyncError::Store(format!(
            "{kind} record {key}: expected one affected row, got {changed}"
        )));
    }
    Ok(())
}

fn last_sync_key(kind: ResourceKind) -> String {
    format!("last_sync:{kind}")
}

fn parse_payload(text: &str) -> Result<Value, SyncError> {
    serde_json::from_str(text).map_err(|err| SyncError::Store(err.to_string()))
}

fn grouped_counts(conn: &Connection, sql: &str) -> Result<BTreeMap<String, usize>, SyncError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    let mut counts = BTreeMap::new();
    for row in rows {
        let (name, count) = row?;
        counts.insert(name, count as usize);
    }
    Ok(counts)
}

const CHECKPOINT_COLUMNS: &str =
    "SELECT campaign, last_key, attempted, succeeded, failed, updated_at FROM checkpoints";

struct RawCheckpoint {
    campaign: String,
    last_key: Option<String>,
    attempted: i64,
    succeeded: i64,
    failed: i64,
    updated_at: String,
}

fn read_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCheckpoint> {
    Ok(RawCheckpoint {
        campaign: row.get(0)?,
        last_key: row.get(1)?,
        attempted: row.get(2)?,
        succeeded: row.get(3)?,
        failed: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

impl RawCheckpoint {
    fn into_checkpoint(self) -> Result<Checkpoint, SyncError> {
        Ok(Checkpoint {
            campaign: self.campaign,
            last_key: self.last_key.map(|key| key.parse()).transpose()?,
            attempted: self.attempted as u64,
            succeeded: self.succeeded as u64,
            failed: self.failed as u64,
            updated_at: Some(self.updated_at),
        })
    }
}

fn apply_pragmas(conn: &Connection, on_disk: bool) -> Result<(), SyncError> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    if on_disk {
        conn.execute_batch("PRAGMA journal_mode = wal;")?;
        conn.execute_batch("PRAGMA synchronous = full;")?;
    }
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

fn initialize_schema(conn: &mut Connection) -> Result<(), SyncError> {
    let tx = conn.transaction()?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", [], |row| row.get(0))
        .optional()?;
    match version {
        None => {
            tx.execute(
                "INSERT INTO store_meta (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
            tx.execute_batch(SCHEMA)?;
        }
        Some(value) if value == SCHEMA_VERSION => {}
        Some(value) => {
            return Err(SyncError::Store(format!(
                "unsupported store schema version {value}"
            )));
        }
    }
    tx.commit()?;
    Ok(())
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS source_records (
    kind TEXT NOT NULL,
    key TEXT NOT NULL,
    payload TEXT NOT NULL,
    last_modified TEXT,
    checksum TEXT NOT NULL,
    local_updated TEXT NOT NULL,
    PRIMARY KEY (kind, key)
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    mode TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    outcome TEXT NOT NULL,
    inserted INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    unchanged INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    reason TEXT
);

CREATE TABLE IF NOT EXISTS change_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES sync_runs(id),
    kind TEXT NOT NULL,
    subject_key TEXT NOT NULL,
    change_kind TEXT NOT NULL,
    previous_checksum TEXT,
    new_checksum TEXT,
    old_values TEXT,
    new_values TEXT,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_change_records_subject
    ON change_records (kind, subject_key, id);
CREATE INDEX IF NOT EXISTS idx_change_records_time
    ON change_records (recorded_at);
CREATE TRIGGER IF NOT EXISTS change_records_no_update
    BEFORE UPDATE ON change_records
    BEGIN SELECT RAISE(ABORT, 'change_records is append-only'); END;
CREATE TRIGGER IF NOT EXISTS change_records_no_delete
    BEFORE DELETE ON change_records
    BEGIN SELECT RAISE(ABORT, 'change_records is append-only'); END;

CREATE TABLE IF NOT EXISTS sync_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    campaign TEXT PRIMARY KEY,
    last_key TEXT,
    attempted INTEGER NOT NULL DEFAULT 0,
    succeeded INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS campaign_failures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    campaign TEXT NOT NULL,
    key TEXT NOT NULL,
    error_kind TEXT NOT NULL,
    message TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS isotherm_details (
    filename TEXT PRIMARY KEY,
    pressure_units TEXT,
    adsorption_units TEXT,
    adsorbates TEXT NOT NULL,
    temperature REAL,
    point_count INTEGER NOT NULL,
    fetched_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS isotherm_points (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL REFERENCES isotherm_details(filename) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    pressure REAL,
    total_adsorption REAL,
    species_data TEXT,
    UNIQUE (filename, seq)
);

CREATE TABLE IF NOT EXISTS normalized_points (
    point_id INTEGER PRIMARY KEY REFERENCES isotherm_points(id) ON DELETE CASCADE,
    filename TEXT NOT NULL,
    pressure_value REAL,
    pressure_unit TEXT,
    pressure_pa REAL,
    pressure_reason TEXT,
    adsorption_value REAL,
    adsorption_unit TEXT,
    adsorption_mol_per_kg REAL,
    adsorption_reason TEXT,
    computed_at TEXT NOT NULL
);

CREATE VIEW IF NOT EXISTS normalized_isotherm_data AS
    SELECT filename, pressure_pa, adsorption_mol_per_kg
    FROM normalized_points
    WHERE pressure_pa IS NOT NULL AND adsorption_mol_per_kg IS NOT NULL;
";
