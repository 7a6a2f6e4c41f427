//! Database repository layer
//!
//! Row-level operations on the encrypted event queue. Every mutation is a
//! single statement or a single transaction, so it is atomic on its own.
//! Callers needing higher-level exclusion (one drain at a time) provide it
//! themselves.

use crate::error::{Error, Result};
use crate::types::{DiscardedEntry, LogEntry, LogType};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Pending entry count for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionBacklog {
    pub submission_id: String,
    pub pending: usize,
    pub oldest_at: Option<DateTime<Utc>>,
}

/// Database handle (single connection behind a mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL with FULL sync: a committed append survives a crash or power cut.
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection()?;
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned("database"))
    }

    // ============================================
    // Queue operations
    // ============================================

    /// Insert an already-encrypted entry, returning its id
    pub fn insert_entry(
        &self,
        submission_id: &str,
        log_type: LogType,
        encrypted_payload: &str,
        created_at: DateTime<Utc>,
        idempotency_key: &str,
    ) -> Result<i64> {
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO log_entries (submission_id, log_type, encrypted_payload,
                                     created_at, upload_attempts, idempotency_key)
            VALUES (?1, ?2, ?3, ?4, 0, ?5)
            "#,
            params![
                submission_id,
                log_type.as_str(),
                encrypted_payload,
                created_at.to_rfc3339(),
                idempotency_key,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All queued entries for a submission, oldest first
    pub fn pending_entries(&self, submission_id: &str) -> Result<Vec<LogEntry>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, submission_id, log_type, encrypted_payload, created_at,
                   upload_attempts, idempotency_key
            FROM log_entries
            WHERE submission_id = ?
            ORDER BY id ASC
            "#,
        )?;

        let entries = stmt
            .query_map([submission_id], Self::row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Number of queued entries for a submission
    pub fn count_pending(&self, submission_id: &str) -> Result<usize> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM log_entries WHERE submission_id = ?",
            [submission_id],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    /// Delete one entry. Returns false if it was already gone.
    pub fn delete_entry(&self, id: i64) -> Result<bool> {
        let conn = self.connection()?;
        let changed = conn.execute("DELETE FROM log_entries WHERE id = ?", [id])?;
        Ok(changed > 0)
    }

    /// Delete several entries in one transaction, returning how many existed
    pub fn delete_entries(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM log_entries WHERE id = ?")?;
            for id in ids {
                changed += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Replace the sealed payload of one entry. Returns false if it was already gone.
    pub fn update_payload(&self, id: i64, encrypted_payload: &str) -> Result<bool> {
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE log_entries SET encrypted_payload = ?1 WHERE id = ?2",
            params![encrypted_payload, id],
        )?;
        Ok(changed > 0)
    }

    /// Bump the attempt counter of one entry. Returns false if it was already gone.
    pub fn increment_attempts(&self, id: i64) -> Result<bool> {
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE log_entries SET upload_attempts = upload_attempts + 1 WHERE id = ?",
            [id],
        )?;
        Ok(changed > 0)
    }

    /// Bump the attempt counter of several entries in one transaction
    pub fn increment_attempts_many(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE log_entries SET upload_attempts = upload_attempts + 1 WHERE id = ?",
            )?;
            for id in ids {
                changed += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Delete an exhausted entry and record the loss in the audit table.
    ///
    /// Both happen in one transaction. Returns false if the entry was already gone,
    /// in which case nothing is recorded.
    pub fn discard_entry(&self, entry: &LogEntry, discarded_at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let removed = tx.execute("DELETE FROM log_entries WHERE id = ?", [entry.id])?;
        if removed == 0 {
            return Ok(false);
        }

        tx.execute(
            r#"
            INSERT INTO discarded_entries (entry_id, submission_id, log_type,
                                           upload_attempts, created_at, discarded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.id,
                entry.submission_id,
                entry.log_type.as_str(),
                entry.upload_attempts,
                entry.created_at.to_rfc3339(),
                discarded_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Audit trail of discarded entries for a submission, oldest first
    pub fn discarded_entries(&self, submission_id: &str) -> Result<Vec<DiscardedEntry>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT entry_id, submission_id, log_type, upload_attempts, created_at, discarded_at
            FROM discarded_entries
            WHERE submission_id = ?
            ORDER BY discarded_at ASC, entry_id ASC
            "#,
        )?;

        let rows = stmt
            .query_map([submission_id], |row| {
                Ok(DiscardedEntry {
                    entry_id: row.get("entry_id")?,
                    submission_id: row.get("submission_id")?,
                    log_type: parse_log_type(row, "log_type")?,
                    upload_attempts: row.get("upload_attempts")?,
                    created_at: parse_timestamp(row.get("created_at")?),
                    discarded_at: parse_timestamp(row.get("discarded_at")?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Every submission with queued entries
    pub fn backlog(&self) -> Result<Vec<SubmissionBacklog>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT submission_id, COUNT(*) AS pending, MIN(created_at) AS oldest_at
            FROM log_entries
            GROUP BY submission_id
            ORDER BY submission_id ASC
            "#,
        )?;

        let rows = stmt
            .query_map([], |row| {
                let pending: i64 = row.get("pending")?;
                let oldest: Option<String> = row.get("oldest_at")?;
                Ok(SubmissionBacklog {
                    submission_id: row.get("submission_id")?,
                    pending: pending as usize,
                    oldest_at: oldest.map(parse_timestamp),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    fn row_to_entry(row: &Row) -> rusqlite::Result<LogEntry> {
        let idempotency_key: Option<String> = row.get("idempotency_key")?;
        let id: i64 = row.get("id")?;

        Ok(LogEntry {
            id,
            submission_id: row.get("submission_id")?,
            log_type: parse_log_type(row, "log_type")?,
            encrypted_payload: row.get("encrypted_payload")?,
            created_at: parse_timestamp(row.get("created_at")?),
            upload_attempts: row.get("upload_attempts")?,
            idempotency_key: idempotency_key.unwrap_or_else(|| format!("local-{}", id)),
        })
    }
}

fn parse_log_type(row: &Row, column: &str) -> rusqlite::Result<LogType> {
    let raw: String = row.get(column)?;
    let idx = row.as_ref().column_index(column)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn parse_timestamp(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
