//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: encrypted event queue
    r#"
    CREATE TABLE IF NOT EXISTS log_entries (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        submission_id     TEXT NOT NULL,
        log_type          TEXT NOT NULL,      -- 'SCREENSHOT', 'KEYSTROKE', ...
        encrypted_payload TEXT NOT NULL,      -- base64(nonce || ciphertext || tag)
        created_at        DATETIME NOT NULL,
        upload_attempts   INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_log_entries_submission ON log_entries(submission_id, id);
    "#,
    // Version 2: idempotency keys and discard audit trail
    r#"
    ALTER TABLE log_entries ADD COLUMN idempotency_key TEXT;

    -- Backfill rows queued before this migration
    UPDATE log_entries
       SET idempotency_key = lower(hex(randomblob(16)))
     WHERE idempotency_key IS NULL;

    -- Entries dropped after exhausting their upload attempts.
    -- Payloads are not kept; this only records that data was lost.
    CREATE TABLE IF NOT EXISTS discarded_entries (
        entry_id         INTEGER NOT NULL,
        submission_id    TEXT NOT NULL,
        log_type         TEXT NOT NULL,
        upload_attempts  INTEGER NOT NULL,
        created_at       DATETIME NOT NULL,
        discarded_at     DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_discarded_submission ON discarded_entries(submission_id);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(migration)?;
            tx.execute(&format!("PRAGMA user_version = {}", version), [])?;
            tx.commit()?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
