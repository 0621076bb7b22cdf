//! `SQLite`-backed implementation of [`StateBackend`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Multi-row updates
//! run inside one transaction so a crash never leaves them half-applied.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use changebyte_types::envelope::{DeadLetterRecord, Timestamp};
use changebyte_types::record::{ApplyResult, CorrelationRecord, DedupKey, SkipReason};
use changebyte_types::state::{PendingApply, PipelineId, RunStats, RunStatus, StoredDeadLetter};
use chrono::{NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::backend::StateBackend;
use crate::error::{self, StateError};
use crate::schema::CREATE_TABLES;

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

impl SqliteStateBackend {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(StateError::backend)?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("open: create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("in_memory: create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }

    /// Convert an ISO-8601 string to `SQLite` datetime format.
    fn iso8601_to_sqlite(iso: &str) -> String {
        chrono::DateTime::parse_from_rfc3339(iso).map_or_else(
            |_| iso.to_string(),
            |dt| dt.with_timezone(&Utc).format(SQLITE_DATETIME_FMT).to_string(),
        )
    }

    fn decode_dead_letter(
        id: i64,
        pipeline: String,
        run_id: i64,
        record_json: &str,
        replayed_at: Option<String>,
    ) -> error::Result<StoredDeadLetter> {
        let record: DeadLetterRecord = serde_json::from_str(record_json)
            .map_err(|e| StateError::Corrupt(format!("dead letter {id}: {e}")))?;
        Ok(StoredDeadLetter {
            id,
            pipeline: PipelineId::new(pipeline),
            run_id,
            record,
            replayed_at: replayed_at.map(|raw| Timestamp::new(Self::sqlite_to_iso8601(&raw))),
        })
    }

    #[cfg(test)]
    fn get_run_row(
        &self,
        run_id: i64,
    ) -> error::Result<(String, i64, Option<String>, Option<String>)> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT status, events_read, finished_at, error_message FROM relay_runs WHERE id = ?1",
            [run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .map_err(StateError::backend)
    }
}

/// Run counters saturate at `i64::MAX`.
fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Sequences are compared in SQL, so they must round-trip exactly.
fn sql_sequence(value: u64) -> error::Result<i64> {
    i64::try_from(value).map_err(|_| StateError::SequenceOutOfRange(value))
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

impl StateBackend for SqliteStateBackend {
    fn start_run(&self, pipeline: &PipelineId) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO relay_runs (pipeline, status) VALUES (?1, ?2)",
            rusqlite::params![pipeline.as_str(), RunStatus::Running.as_str()],
        )
        .map_err(StateError::backend)?;
        Ok(conn.last_insert_rowid())
    }

    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE relay_runs SET status = ?1, finished_at = datetime('now'), \
             events_read = ?2, events_applied = ?3, events_skipped = ?4, \
             dead_lettered = ?5, retries = ?6, error_message = ?7 \
             WHERE id = ?8",
            rusqlite::params![
                status.as_str(),
                to_sql_int(stats.events_read),
                to_sql_int(stats.events_applied),
                to_sql_int(stats.events_skipped),
                to_sql_int(stats.dead_lettered),
                to_sql_int(stats.retries),
                stats.error_message,
                run_id,
            ],
        )
        .map_err(StateError::backend)?;
        Ok(())
    }

    fn lookup_dedup(
        &self,
        pipeline: &PipelineId,
        key: &DedupKey,
    ) -> error::Result<Option<ApplyResult>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT destination_id, applied, reason FROM dedup_index \
                 WHERE pipeline = ?1 AND dedup_key = ?2",
                rusqlite::params![pipeline.as_str(), key.as_str()],
                |row| {
                    let destination_id: Option<String> = row.get(0)?;
                    let applied: bool = row.get(1)?;
                    let reason: Option<String> = row.get(2)?;
                    Ok((destination_id, applied, reason))
                },
            )
            .optional()
            .map_err(StateError::backend)?;

        let Some((destination_id, applied, reason)) = row else {
            return Ok(None);
        };
        let reason = match reason {
            Some(raw) => Some(SkipReason::parse(&raw).ok_or_else(|| {
                StateError::Corrupt(format!("dedup {key}: unknown skip reason '{raw}'"))
            })?),
            None => None,
        };
        Ok(Some(ApplyResult {
            destination_id,
            applied,
            reason,
        }))
    }

    fn applied_sequence(
        &self,
        pipeline: &PipelineId,
        source_id: &str,
    ) -> error::Result<Option<u64>> {
        let conn = self.lock_conn()?;
        let sequence: Option<i64> = conn
            .query_row(
                "SELECT sequence FROM applied_sequences WHERE pipeline = ?1 AND source_id = ?2",
                rusqlite::params![pipeline.as_str(), source_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StateError::backend)?;
        Ok(sequence.map(from_sql_int))
    }

    fn begin_apply(&self, pipeline: &PipelineId, pending: &PendingApply) -> error::Result<()> {
        let sequence = sql_sequence(pending.sequence)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO apply_journal (pipeline, dedup_key, source_id, sequence, started_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(pipeline, dedup_key) DO UPDATE SET started_at = ?5",
            rusqlite::params![
                pipeline.as_str(),
                pending.dedup_key.as_str(),
                pending.source_id,
                sequence,
                Self::iso8601_to_sqlite(pending.started_at.as_str()),
            ],
        )
        .map_err(|e| StateError::backend_context("begin_apply", e))?;
        Ok(())
    }

    fn commit_apply(
        &self,
        pipeline: &PipelineId,
        key: &DedupKey,
        source_id: &str,
        sequence: u64,
        result: &ApplyResult,
    ) -> error::Result<bool> {
        let sequence = sql_sequence(sequence)?;
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("commit_apply: begin tx", e))?;

        tx.execute(
            "INSERT OR IGNORE INTO dedup_index \
             (pipeline, dedup_key, source_id, sequence, destination_id, applied, reason) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                pipeline.as_str(),
                key.as_str(),
                source_id,
                sequence,
                result.destination_id,
                result.applied,
                result.reason.map(SkipReason::as_str),
            ],
        )
        .map_err(|e| StateError::backend_context("commit_apply: dedup", e))?;

        let advanced = tx
            .execute(
                "INSERT INTO applied_sequences (pipeline, source_id, sequence, updated_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(pipeline, source_id) DO UPDATE \
                 SET sequence = excluded.sequence, updated_at = excluded.updated_at \
                 WHERE excluded.sequence > applied_sequences.sequence",
                rusqlite::params![
                    pipeline.as_str(),
                    source_id,
                    sequence,
                    Self::now_sqlite(),
                ],
            )
            .map_err(|e| StateError::backend_context("commit_apply: sequence", e))?;

        tx.execute(
            "DELETE FROM apply_journal WHERE pipeline = ?1 AND dedup_key = ?2",
            rusqlite::params![pipeline.as_str(), key.as_str()],
        )
        .map_err(|e| StateError::backend_context("commit_apply: journal", e))?;

        tx.commit()
            .map_err(|e| StateError::backend_context("commit_apply: commit", e))?;
        Ok(advanced > 0)
    }

    fn pending_applies(&self, pipeline: &PipelineId) -> error::Result<Vec<PendingApply>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT dedup_key, source_id, sequence, started_at FROM apply_journal \
                 WHERE pipeline = ?1 ORDER BY started_at, source_id",
            )
            .map_err(StateError::backend)?;
        let rows = stmt
            .query_map([pipeline.as_str()], |row| {
                let key: String = row.get(0)?;
                let source_id: String = row.get(1)?;
                let sequence: i64 = row.get(2)?;
                let started_at: String = row.get(3)?;
                Ok(PendingApply {
                    dedup_key: DedupKey::from_raw(key),
                    source_id,
                    sequence: from_sql_int(sequence),
                    started_at: Timestamp::new(Self::sqlite_to_iso8601(&started_at)),
                })
            })
            .map_err(StateError::backend)?;
        let pending = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::backend)?;
        Ok(pending)
    }

    fn remember_natural_key(
        &self,
        pipeline: &PipelineId,
        entity: &str,
        source_id: &str,
        natural_key: &str,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO natural_keys (pipeline, entity, source_id, natural_key) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(pipeline, entity, source_id) DO UPDATE \
             SET natural_key = excluded.natural_key",
            rusqlite::params![pipeline.as_str(), entity, source_id, natural_key],
        )
        .map_err(|e| StateError::backend_context("remember_natural_key", e))?;
        Ok(())
    }

    fn natural_key(
        &self,
        pipeline: &PipelineId,
        entity: &str,
        source_id: &str,
    ) -> error::Result<Option<String>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT natural_key FROM natural_keys \
             WHERE pipeline = ?1 AND entity = ?2 AND source_id = ?3",
            rusqlite::params![pipeline.as_str(), entity, source_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(StateError::backend)
    }

    fn get_correlation(
        &self,
        pipeline: &PipelineId,
        source_id: &str,
    ) -> error::Result<Option<CorrelationRecord>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT destination_id, applied_sequence FROM correlations \
             WHERE pipeline = ?1 AND source_id = ?2",
            rusqlite::params![pipeline.as_str(), source_id],
            |row| {
                let destination_id: String = row.get(0)?;
                let applied_sequence: i64 = row.get(1)?;
                Ok(CorrelationRecord {
                    source_id: source_id.to_string(),
                    destination_id,
                    applied_sequence: from_sql_int(applied_sequence),
                })
            },
        )
        .optional()
        .map_err(StateError::backend)
    }

    fn put_correlation(
        &self,
        pipeline: &PipelineId,
        record: &CorrelationRecord,
    ) -> error::Result<bool> {
        let applied_sequence = sql_sequence(record.applied_sequence)?;
        let conn = self.lock_conn()?;
        let rows_affected = conn
            .execute(
                "INSERT INTO correlations (pipeline, source_id, destination_id, applied_sequence, written_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(pipeline, source_id) DO UPDATE \
                 SET destination_id = excluded.destination_id, \
                     applied_sequence = excluded.applied_sequence, \
                     written_at = excluded.written_at \
                 WHERE excluded.applied_sequence > correlations.applied_sequence",
                rusqlite::params![
                    pipeline.as_str(),
                    record.source_id,
                    record.destination_id,
                    applied_sequence,
                    Self::now_sqlite(),
                ],
            )
            .map_err(|e| StateError::backend_context("put_correlation", e))?;
        Ok(rows_affected > 0)
    }

    fn insert_dead_letter(
        &self,
        pipeline: &PipelineId,
        run_id: i64,
        record: &DeadLetterRecord,
    ) -> error::Result<i64> {
        let record_json = serde_json::to_string(record)
            .map_err(|e| StateError::Corrupt(format!("encode dead letter: {e}")))?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO dead_letters \
             (pipeline, run_id, source_id, sequence, stage, error_kind, error_code, \
              error_message, attempt_count, record_json, failed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                pipeline.as_str(),
                run_id,
                record.envelope.source_id(),
                to_sql_int(record.envelope.sequence()),
                record.stage.as_str(),
                record.error_kind.as_str(),
                record.error_code,
                record.error_message,
                record.attempt_count,
                record_json,
                record.failed_at.as_str(),
            ],
        )
        .map_err(|e| StateError::backend_context("insert_dead_letter", e))?;
        Ok(conn.last_insert_rowid())
    }

    fn list_dead_letters(
        &self,
        pipeline: &PipelineId,
        include_replayed: bool,
    ) -> error::Result<Vec<StoredDeadLetter>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, pipeline, run_id, record_json, replayed_at FROM dead_letters \
                 WHERE pipeline = ?1 AND (?2 OR replayed_at IS NULL) ORDER BY id",
            )
            .map_err(StateError::backend)?;
        let rows = stmt
            .query_map(rusqlite::params![pipeline.as_str(), include_replayed], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .map_err(StateError::backend)?;

        let mut out = Vec::new();
        for row in rows {
            let (id, pipeline, run_id, record_json, replayed_at) =
                row.map_err(StateError::backend)?;
            out.push(Self::decode_dead_letter(
                id,
                pipeline,
                run_id,
                &record_json,
                replayed_at,
            )?);
        }
        Ok(out)
    }

    fn get_dead_letter(
        &self,
        pipeline: &PipelineId,
        id: i64,
    ) -> error::Result<Option<StoredDeadLetter>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT id, pipeline, run_id, record_json, replayed_at FROM dead_letters \
                 WHERE pipeline = ?1 AND id = ?2",
                rusqlite::params![pipeline.as_str(), id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(StateError::backend)?;
        row.map(|(id, pipeline, run_id, record_json, replayed_at)| {
            Self::decode_dead_letter(id, pipeline, run_id, &record_json, replayed_at)
        })
        .transpose()
    }

    fn mark_dead_letter_replayed(&self, pipeline: &PipelineId, id: i64) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let rows_affected = conn
            .execute(
                "UPDATE dead_letters SET replayed_at = ?1 \
                 WHERE pipeline = ?2 AND id = ?3 AND replayed_at IS NULL",
                rusqlite::params![Self::now_sqlite(), pipeline.as_str(), id],
            )
            .map_err(|e| StateError::backend_context("mark_dead_letter_replayed", e))?;
        Ok(rows_affected > 0)
    }
}
