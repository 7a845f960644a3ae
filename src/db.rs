//! SQLite database setup shared by the job store and the mail cache
//!
//! Both stores open their own connection to the same file; WAL mode lets the
//! read side of one proceed while the other writes.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use rusqlite::types::Type;
use rusqlite_migration::{M, Migrations};
use serde::de::DeserializeOwned;

use crate::errors::{AppError, AppResult};

/// Database migrations
///
/// Applied in order; `user_version` tracks which have run.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: job queue and event log
        M::up(
            r#"
            CREATE TABLE jobs (
                job_id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                params TEXT NOT NULL DEFAULT '{}',
                dedupe_key TEXT,
                worker_id TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                total_estimate INTEGER,
                processed INTEGER NOT NULL DEFAULT 0,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                error TEXT
            );

            CREATE INDEX idx_jobs_status_created ON jobs(status, created_at);

            -- At most one pending job per dedupe key
            CREATE UNIQUE INDEX idx_jobs_pending_dedupe
                ON jobs(dedupe_key) WHERE status = 'pending' AND dedupe_key IS NOT NULL;

            CREATE TABLE job_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES jobs(job_id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                level TEXT NOT NULL DEFAULT 'info',
                message TEXT NOT NULL,
                data TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX idx_job_events_job ON job_events(job_id, id);
            "#,
        ),
        // Migration 2: local mail cache
        M::up(
            r#"
            CREATE TABLE folder_markers (
                folder TEXT PRIMARY KEY,
                uidvalidity INTEGER NOT NULL,
                uid_next INTEGER,
                exists_count INTEGER NOT NULL,
                highest_modseq INTEGER,
                synced_at TEXT NOT NULL
            );

            CREATE TABLE messages (
                folder TEXT NOT NULL,
                uid INTEGER NOT NULL,
                uidvalidity INTEGER NOT NULL,
                message_id TEXT,
                subject TEXT,
                from_addr TEXT,
                to_addr TEXT,
                date TEXT,
                flags TEXT NOT NULL DEFAULT '[]',
                size_bytes INTEGER,
                body_preview TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (folder, uid)
            );

            CREATE INDEX idx_messages_live ON messages(folder, deleted);
            "#,
        ),
    ])
}

/// Open (creating if needed) the database at `path` and migrate it
///
/// # Errors
///
/// Returns `Storage` if the file cannot be opened or a migration fails.
pub fn open(path: &Path) -> AppResult<Connection> {
    let conn = Connection::open(path).map_err(|e| {
        AppError::Storage(format!("failed to open database at {}: {e}", path.display()))
    })?;
    prepare(conn)
}

/// Open a private in-memory database; each call yields an independent one
#[cfg(test)]
pub fn open_in_memory() -> AppResult<Connection> {
    prepare(Connection::open_in_memory()?)
}

/// Format a timestamp for storage
///
/// Fixed-width RFC 3339 with microseconds, so text order equals time order.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp column
pub fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Parse a stored JSON column
pub fn parse_json<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn prepare(mut conn: Connection) -> AppResult<Connection> {
    // foreign_keys is per-connection and needed for event cascade
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        "#,
    )?;
    migrations().to_latest(&mut conn)?;
    Ok(conn)
}
