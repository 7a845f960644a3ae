//! Local mail cache reconciled by folder sync tasks
//!
//! Stores one row per (folder, uid) plus a per-folder change marker. Rows are
//! never removed by sync; server-side removals flip the `deleted` flag.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::db::{self, parse_timestamp, timestamp};
use crate::errors::{AppError, AppResult};

/// Last reconciled state of a folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderMarker {
    pub folder: String,
    pub uidvalidity: u32,
    pub uid_next: Option<u32>,
    pub exists: u32,
    pub highest_modseq: Option<u64>,
    pub synced_at: DateTime<Utc>,
}

/// Cached envelope data for one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedMessage {
    pub folder: String,
    pub uid: u32,
    pub uidvalidity: u32,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from_addr: Option<String>,
    pub to_addr: Option<String>,
    pub date: Option<String>,
    pub flags: Vec<String>,
    pub size_bytes: Option<u32>,
    pub body_preview: Option<String>,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}

const MESSAGE_COLUMNS: &str = "folder, uid, uidvalidity, message_id, subject, from_addr, \
     to_addr, date, flags, size_bytes, body_preview, deleted, updated_at";

#[cfg(test)]
fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedMessage> {
    let flags: String = row.get(8)?;
    let updated_at: String = row.get(12)?;
    Ok(CachedMessage {
        folder: row.get(0)?,
        uid: row.get(1)?,
        uidvalidity: row.get(2)?,
        message_id: row.get(3)?,
        subject: row.get(4)?,
        from_addr: row.get(5)?,
        to_addr: row.get(6)?,
        date: row.get(7)?,
        flags: db::parse_json(8, &flags)?,
        size_bytes: row.get(9)?,
        body_preview: row.get(10)?,
        deleted: row.get(11)?,
        updated_at: parse_timestamp(12, &updated_at)?,
    })
}

/// SQLite-backed message cache
pub struct MailCache {
    conn: Mutex<Connection>,
}

impl MailCache {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: &std::path::Path) -> AppResult<Self> {
        Ok(Self::new(db::open(path)?))
    }

    #[cfg(test)]
    pub fn in_memory() -> AppResult<Self> {
        Ok(Self::new(db::open_in_memory()?))
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("mail cache mutex poisoned".to_owned()))
    }

    pub fn folder_marker(&self, folder: &str) -> AppResult<Option<FolderMarker>> {
        let conn = self.lock()?;
        let marker = conn
            .query_row(
                "SELECT folder, uidvalidity, uid_next, exists_count, highest_modseq, synced_at
                 FROM folder_markers WHERE folder = ?1",
                [folder],
                |row| {
                    let synced_at: String = row.get(5)?;
                    Ok(FolderMarker {
                        folder: row.get(0)?,
                        uidvalidity: row.get(1)?,
                        uid_next: row.get(2)?,
                        exists: row.get(3)?,
                        highest_modseq: row.get(4)?,
                        synced_at: parse_timestamp(5, &synced_at)?,
                    })
                },
            )
            .optional()?;
        Ok(marker)
    }

    pub fn save_marker(&self, marker: &FolderMarker) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO folder_markers
                 (folder, uidvalidity, uid_next, exists_count, highest_modseq, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(folder) DO UPDATE SET
                 uidvalidity = excluded.uidvalidity,
                 uid_next = excluded.uid_next,
                 exists_count = excluded.exists_count,
                 highest_modseq = excluded.highest_modseq,
                 synced_at = excluded.synced_at",
            params![
                marker.folder,
                marker.uidvalidity,
                marker.uid_next,
                marker.exists,
                marker.highest_modseq,
                timestamp(marker.synced_at)
            ],
        )?;
        Ok(())
    }

    /// UIDs of non-deleted messages, ascending
    pub fn live_uids(&self, folder: &str) -> AppResult<Vec<u32>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT uid FROM messages WHERE folder = ?1 AND deleted = 0 ORDER BY uid",
        )?;
        let uids = stmt
            .query_map([folder], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(uids)
    }

    /// Insert or replace a batch of messages in one transaction
    ///
    /// Upserted rows are live again even if previously marked deleted.
    pub fn upsert_batch(&self, messages: &[CachedMessage]) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12)
                 ON CONFLICT(folder, uid) DO UPDATE SET
                     uidvalidity = excluded.uidvalidity,
                     message_id = excluded.message_id,
                     subject = excluded.subject,
                     from_addr = excluded.from_addr,
                     to_addr = excluded.to_addr,
                     date = excluded.date,
                     flags = excluded.flags,
                     size_bytes = excluded.size_bytes,
                     body_preview = COALESCE(excluded.body_preview, messages.body_preview),
                     deleted = 0,
                     updated_at = excluded.updated_at"
            ))?;
            let now = timestamp(Utc::now());
            for msg in messages {
                stmt.execute(params![
                    msg.folder,
                    msg.uid,
                    msg.uidvalidity,
                    msg.message_id,
                    msg.subject,
                    msg.from_addr,
                    msg.to_addr,
                    msg.date,
                    serde_json::to_string(&msg.flags)?,
                    msg.size_bytes,
                    msg.body_preview,
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(messages.len())
    }

    /// Flag live messages as deleted; returns how many changed
    pub fn mark_deleted(&self, folder: &str, uids: &[u32]) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE messages SET deleted = 1, updated_at = ?3
                 WHERE folder = ?1 AND uid = ?2 AND deleted = 0",
            )?;
            let now = timestamp(Utc::now());
            for uid in uids {
                changed += stmt.execute(params![folder, uid, now])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Forget a folder's marker and flag all its rows deleted
    ///
    /// Used when the server reports a new UIDVALIDITY.
    pub fn reset_folder(&self, folder: &str) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE messages SET deleted = 1, updated_at = ?2 WHERE folder = ?1 AND deleted = 0",
            params![folder, timestamp(Utc::now())],
        )?;
        tx.execute("DELETE FROM folder_markers WHERE folder = ?1", [folder])?;
        tx.commit()?;
        Ok(changed)
    }

    /// Add `flag` to the cached flags of the given messages
    pub fn add_flag(&self, folder: &str, uids: &[u32], flag: &str) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut select =
                tx.prepare("SELECT flags FROM messages WHERE folder = ?1 AND uid = ?2")?;
            let mut update = tx.prepare(
                "UPDATE messages SET flags = ?3, updated_at = ?4 WHERE folder = ?1 AND uid = ?2",
            )?;
            let now = timestamp(Utc::now());
            for uid in uids {
                let raw: Option<String> = select
                    .query_row(params![folder, uid], |row| row.get(0))
                    .optional()?;
                let Some(raw) = raw else { continue };
                let mut flags: Vec<String> = serde_json::from_str(&raw)?;
                if flags.iter().any(|f| f.eq_ignore_ascii_case(flag)) {
                    continue;
                }
                flags.push(flag.to_owned());
                let encoded = serde_json::to_string(&flags)?;
                changed += update.execute(params![folder, uid, encoded, now])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    #[cfg(test)]
    pub fn get_message(&self, folder: &str, uid: u32) -> AppResult<Option<CachedMessage>> {
        let conn = self.lock()?;
        let msg = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE folder = ?1 AND uid = ?2"),
                params![folder, uid],
                message_from_row,
            )
            .optional()?;
        Ok(msg)
    }

    pub fn count_live(&self, folder: &str) -> AppResult<u64> {
        let conn = self.lock()?;
        let n = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE folder = ?1 AND deleted = 0",
            [folder],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}
