//! Durable job queue and append-only job event log
//!
//! Jobs move `pending → running → {completed, failed, cancelled}`. Only the
//! worker that claimed a job writes progress, events and the final status;
//! every such write is rejected with `InvalidTransition` unless the job is
//! still `running`. External callers may enqueue, read and request
//! cancellation.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, params};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{self, parse_json, parse_timestamp, timestamp};
use crate::errors::{AppError, AppResult};

/// Error stored on jobs failed by startup recovery
pub const INTERRUPTED_ERROR: &str = "interrupted: engine restarted before the job finished";

const JOB_COLUMNS: &str = "job_id, job_type, status, params, dedupe_key, worker_id, created_at, \
     started_at, finished_at, total_estimate, processed, cancel_requested, error";

/// Kind of work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Sync,
    MutationBatch,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::MutationBatch => "mutation_batch",
        }
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses are final
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a job event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for JobType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Self::Sync),
            "mutation_batch" => Ok(Self::MutationBatch),
            other => Err(AppError::invalid(format!("unknown job type '{other}'"))),
        }
    }
}

impl FromStr for JobStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AppError::invalid(format!("unknown job status '{other}'"))),
        }
    }
}

impl FromStr for EventLevel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(AppError::invalid(format!("unknown event level '{other}'"))),
        }
    }
}

macro_rules! text_column {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: AppError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_column!(JobType);
text_column!(JobStatus);
text_column!(EventLevel);

/// A queued unit of work
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub params: Value,
    pub dedupe_key: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_estimate: Option<u64>,
    pub processed: u64,
    pub cancel_requested: bool,
    pub error: Option<String>,
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let params: String = row.get(3)?;
    let created_at: String = row.get(6)?;
    let started_at: Option<String> = row.get(7)?;
    let finished_at: Option<String> = row.get(8)?;
    Ok(Job {
        job_id: row.get(0)?,
        job_type: row.get(1)?,
        status: row.get(2)?,
        params: parse_json(3, &params)?,
        dedupe_key: row.get(4)?,
        worker_id: row.get(5)?,
        created_at: parse_timestamp(6, &created_at)?,
        started_at: started_at.map(|s| parse_timestamp(7, &s)).transpose()?,
        finished_at: finished_at.map(|s| parse_timestamp(8, &s)).transpose()?,
        total_estimate: row.get(9)?,
        processed: row.get(10)?,
        cancel_requested: row.get(11)?,
        error: row.get(12)?,
    })
}

/// One entry of a job's event log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
    pub data: Value,
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<JobEvent> {
    let created_at: String = row.get(2)?;
    let data: String = row.get(5)?;
    Ok(JobEvent {
        id: row.get(0)?,
        job_id: row.get(1)?,
        created_at: parse_timestamp(2, &created_at)?,
        level: row.get(3)?,
        message: row.get(4)?,
        data: parse_json(5, &data)?,
    })
}

/// Result of a deduplicated enqueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// A new pending job was created
    New(String),
    /// A pending job with the same key already existed
    Existing(String),
}

impl Enqueued {
    pub fn job_id(&self) -> &str {
        match self {
            Self::New(id) | Self::Existing(id) => id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }
}

/// Number of jobs per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// SQLite-backed job store
///
/// A single instance is shared by the whole process. Enqueues wake idle
/// workers through an internal `Notify`.
pub struct JobStore {
    conn: Mutex<Connection>,
    wake: Notify,
}

impl JobStore {
    /// Wrap an already migrated connection
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            wake: Notify::new(),
        }
    }

    /// Open the store at `path`, creating and migrating the database
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
            .map_err(|_| AppError::Internal("job store mutex poisoned".to_owned()))
    }

    /// Create a pending job and wake idle workers
    pub fn enqueue(&self, job_type: JobType, params: Value) -> AppResult<String> {
        let job_id = Uuid::new_v4().to_string();
        {
            let conn = self.lock()?;
            insert_job(&conn, &job_id, job_type, &params, None)?;
        }
        debug!(job_id = %job_id, job_type = job_type.as_str(), "job enqueued");
        self.wake.notify_waiters();
        Ok(job_id)
    }

    /// Create a pending job unless one with the same key is already pending
    ///
    /// Only pending jobs count: a job that is already running gets exactly
    /// one pending follow-up.
    pub fn enqueue_unique(
        &self,
        job_type: JobType,
        params: Value,
        dedupe_key: &str,
    ) -> AppResult<Enqueued> {
        let outcome = {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT job_id FROM jobs WHERE dedupe_key = ?1 AND status = 'pending' LIMIT 1",
                    [dedupe_key],
                    |row| row.get(0),
                )
                .optional()?;
            let outcome = match existing {
                Some(job_id) => Enqueued::Existing(job_id),
                None => {
                    let job_id = Uuid::new_v4().to_string();
                    insert_job(&tx, &job_id, job_type, &params, Some(dedupe_key))?;
                    Enqueued::New(job_id)
                }
            };
            tx.commit()?;
            outcome
        };
        match &outcome {
            Enqueued::New(job_id) => {
                debug!(job_id = %job_id, dedupe_key, "job enqueued");
                self.wake.notify_waiters();
            }
            Enqueued::Existing(job_id) => {
                debug!(job_id = %job_id, dedupe_key, "pending job already queued");
            }
        }
        Ok(outcome)
    }

    /// Claim the oldest pending job for `worker_id`
    ///
    /// A single conditional update: a caller that loses the race for the
    /// oldest row gets `None` and simply tries again later.
    pub fn claim_next(&self, worker_id: &str) -> AppResult<Option<Job>> {
        let conn = self.lock()?;
        let sql = format!(
            "UPDATE jobs SET status = 'running', worker_id = ?1, started_at = ?2
             WHERE job_id = (
                 SELECT job_id FROM jobs WHERE status = 'pending'
                 ORDER BY created_at, rowid LIMIT 1
             ) AND status = 'pending'
             RETURNING {JOB_COLUMNS}"
        );
        let job = conn
            .query_row(&sql, params![worker_id, timestamp(Utc::now())], job_from_row)
            .optional()?;
        Ok(job)
    }

    /// Add `delta` to `processed`, optionally setting the estimate
    ///
    /// The estimate is raised when the new count would exceed it.
    pub fn record_progress(
        &self,
        job_id: &str,
        delta: u64,
        total_estimate: Option<u64>,
    ) -> AppResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET
                 processed = processed + ?2,
                 total_estimate = CASE
                     WHEN COALESCE(?3, total_estimate) IS NULL THEN NULL
                     ELSE MAX(COALESCE(?3, total_estimate), processed + ?2)
                 END
             WHERE job_id = ?1 AND status = 'running'",
            params![job_id, delta, total_estimate],
        )?;
        if changed == 0 {
            return Err(reject(&conn, job_id, "record progress")?);
        }
        Ok(())
    }

    /// Append an event to a running job's log, returning its id
    pub fn append_event(
        &self,
        job_id: &str,
        level: EventLevel,
        message: &str,
        data: Value,
    ) -> AppResult<i64> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "INSERT INTO job_events (job_id, created_at, level, message, data)
             SELECT ?1, ?2, ?3, ?4, ?5
             WHERE EXISTS (SELECT 1 FROM jobs WHERE job_id = ?1 AND status = 'running')",
            params![
                job_id,
                timestamp(Utc::now()),
                level,
                message,
                event_data(data)?
            ],
        )?;
        if changed == 0 {
            return Err(reject(&conn, job_id, "append event")?);
        }
        Ok(conn.last_insert_rowid())
    }

    /// Move a running job into a terminal status
    ///
    /// `cancelled` requires a prior cancel request; only `failed` keeps an
    /// error message.
    pub fn finish(&self, job_id: &str, status: JobStatus, error: Option<&str>) -> AppResult<()> {
        if !status.is_terminal() {
            return Err(AppError::transition(
                job_id,
                format!("cannot finish with non-terminal status {status}"),
            ));
        }
        let error = match status {
            JobStatus::Failed => Some(error.unwrap_or("job failed")),
            _ => None,
        };
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE jobs SET status = ?2, error = ?3, finished_at = ?4
             WHERE job_id = ?1 AND status = 'running'
               AND (?2 <> 'cancelled' OR cancel_requested = 1)",
            params![job_id, status, error, timestamp(Utc::now())],
        )?;
        if changed == 0 {
            if status == JobStatus::Cancelled
                && current_status(&conn, job_id)? == Some(JobStatus::Running)
            {
                return Err(AppError::transition(job_id, "cancel was never requested"));
            }
            return Err(reject(&conn, job_id, "finish")?);
        }
        Ok(())
    }

    /// Flag a pending or running job for cancellation
    ///
    /// Idempotent. Returns whether the job carries the flag afterwards;
    /// terminal jobs are never newly flagged.
    pub fn request_cancel(&self, job_id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE jobs SET cancel_requested = 1
             WHERE job_id = ?1 AND status IN ('pending', 'running')",
            [job_id],
        )?;
        conn.query_row(
            "SELECT cancel_requested FROM jobs WHERE job_id = ?1",
            [job_id],
            |row| row.get::<_, bool>(0),
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))
    }

    pub fn is_cancel_requested(&self, job_id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT cancel_requested FROM jobs WHERE job_id = ?1",
            [job_id],
            |row| row.get::<_, bool>(0),
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))
    }

    pub fn get_job(&self, job_id: &str) -> AppResult<Option<Job>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
                [job_id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Most recent jobs first, optionally filtered by status
    pub fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> AppResult<Vec<Job>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2"
        ))?;
        let jobs = stmt
            .query_map(params![status, limit], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Events of a job with id greater than `after_id`, ascending
    pub fn list_events(
        &self,
        job_id: &str,
        after_id: i64,
        limit: usize,
    ) -> AppResult<Vec<JobEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, job_id, created_at, level, message, data FROM job_events
             WHERE job_id = ?1 AND id > ?2
             ORDER BY id ASC
             LIMIT ?3",
        )?;
        let events = stmt
            .query_map(params![job_id, after_id, limit], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn status_counts(&self) -> AppResult<StatusCounts> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, JobStatus>(0)?, row.get::<_, u64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            match status {
                JobStatus::Pending => counts.pending = n,
                JobStatus::Running => counts.running = n,
                JobStatus::Completed => counts.completed = n,
                JobStatus::Failed => counts.failed = n,
                JobStatus::Cancelled => counts.cancelled = n,
            }
        }
        Ok(counts)
    }

    /// Fail jobs left `running` by a previous process
    ///
    /// Must run before any worker starts. Returns the ids of recovered jobs.
    pub fn recover_interrupted(&self) -> AppResult<Vec<String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let ids: Vec<String> = {
            let mut stmt = tx.prepare("SELECT job_id FROM jobs WHERE status = 'running'")?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?
        };
        let now = timestamp(Utc::now());
        for job_id in &ids {
            tx.execute(
                "INSERT INTO job_events (job_id, created_at, level, message, data)
                 VALUES (?1, ?2, 'error', ?3, ?4)",
                params![
                    job_id,
                    now,
                    format!("Job failed: {INTERRUPTED_ERROR}"),
                    json!({ "code": "interrupted" }).to_string()
                ],
            )?;
            tx.execute(
                "UPDATE jobs SET status = 'failed', error = ?2, finished_at = ?3 WHERE job_id = ?1",
                params![job_id, INTERRUPTED_ERROR, now],
            )?;
            warn!(job_id = %job_id, "failed job interrupted by restart");
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Delete terminal jobs finished before `older_than`; events cascade
    pub fn prune_finished(&self, older_than: DateTime<Utc>) -> AppResult<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM jobs
             WHERE status IN ('completed', 'failed', 'cancelled') AND finished_at < ?1",
            [timestamp(older_than)],
        )?;
        Ok(deleted)
    }

    /// Wait until a job is enqueued or `max_wait` elapses
    pub async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.wake.notified()).await;
    }
}

fn insert_job(
    conn: &Connection,
    job_id: &str,
    job_type: JobType,
    params: &Value,
    dedupe_key: Option<&str>,
) -> AppResult<()> {
    if !params.is_object() {
        return Err(AppError::invalid("job params must be a JSON object"));
    }
    conn.execute(
        "INSERT INTO jobs (job_id, job_type, status, params, dedupe_key, created_at)
         VALUES (?1, ?2, 'pending', ?3, ?4, ?5)",
        params![
            job_id,
            job_type,
            params.to_string(),
            dedupe_key,
            timestamp(Utc::now())
        ],
    )?;
    Ok(())
}

fn event_data(data: Value) -> AppResult<String> {
    match data {
        Value::Null => Ok("{}".to_owned()),
        Value::Object(_) => Ok(data.to_string()),
        _ => Err(AppError::invalid("event data must be a JSON object")),
    }
}

fn current_status(conn: &Connection, job_id: &str) -> AppResult<Option<JobStatus>> {
    let status = conn
        .query_row("SELECT status FROM jobs WHERE job_id = ?1", [job_id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(status)
}

/// Explain why a write to `job_id` matched no row
fn reject(conn: &Connection, job_id: &str, action: &str) -> AppResult<AppError> {
    Ok(match current_status(conn, job_id)? {
        None => AppError::NotFound(format!("job {job_id}")),
        Some(status) => AppError::transition(job_id, format!("cannot {action} while {status}")),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    use super::{EventLevel, INTERRUPTED_ERROR, JobStatus, JobStore, JobType};
    use crate::errors::AppError;

    fn store() -> JobStore {
        JobStore::in_memory().expect("in-memory store")
    }

    fn sync_params(folder: &str) -> serde_json::Value {
        json!({ "folder": folder, "mode": "incremental" })
    }

    #[test]
    fn claim_marks_job_running_for_one_worker() {
        let store = store();
        let job_id = store.enqueue(JobType::Sync, sync_params("INBOX")).expect("enqueue");

        let job = store.claim_next("worker-1").expect("claim").expect("job available");
        assert_eq!(job.job_id, job_id);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.worker_id.as_deref(), Some("worker-1"));
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_none());
        assert_eq!(job.total_estimate, None);

        assert!(store.claim_next("worker-2").expect("claim").is_none());
    }

    #[test]
    fn claims_oldest_pending_first() {
        let store = store();
        let first = store.enqueue(JobType::Sync, sync_params("A")).expect("enqueue");
        let second = store.enqueue(JobType::Sync, sync_params("B")).expect("enqueue");
        assert_eq!(store.claim_next("w").expect("claim").expect("job").job_id, first);
        assert_eq!(store.claim_next("w").expect("claim").expect("job").job_id, second);
    }

    #[test]
    fn concurrent_claims_hand_out_each_job_exactly_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(JobStore::open(&dir.path().join("jobs.db")).expect("open"));
        let mut expected = HashSet::new();
        for i in 0..40 {
            let id = store
                .enqueue(JobType::Sync, sync_params(&format!("F{i}")))
                .expect("enqueue");
            expected.insert(id);
        }

        let handles: Vec<_> = (0..8)
            .map(|w| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut claimed = Vec::new();
                    while let Some(job) = store.claim_next(&format!("worker-{w}")).expect("claim") {
                        claimed.push(job.job_id);
                    }
                    claimed
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for job_id in handle.join().expect("thread") {
                assert!(seen.insert(job_id), "job claimed twice");
            }
        }
        assert_eq!(seen, expected);
    }

    #[test]
    fn progress_is_monotonic_and_estimate_is_raised_to_fit() {
        let store = store();
        let job_id = store.enqueue(JobType::Sync, sync_params("INBOX")).expect("enqueue");
        store.claim_next("w").expect("claim");

        store.record_progress(&job_id, 0, None).expect("progress");
        let job = store.get_job(&job_id).expect("get").expect("job");
        assert_eq!((job.processed, job.total_estimate), (0, None));

        let mut last = 0;
        for (delta, estimate) in [(5, Some(10)), (4, None), (3, None), (0, Some(4))] {
            store.record_progress(&job_id, delta, estimate).expect("progress");
            let job = store.get_job(&job_id).expect("get").expect("job");
            assert!(job.processed >= last);
            let total = job.total_estimate.expect("estimate known");
            assert!(job.processed <= total, "{} > {}", job.processed, total);
            last = job.processed;
        }
        let job = store.get_job(&job_id).expect("get").expect("job");
        assert_eq!(job.processed, 12);
        assert_eq!(job.total_estimate, Some(12));
    }

    #[test]
    fn worker_writes_require_running_job() {
        let store = store();
        let job_id = store.enqueue(JobType::Sync, sync_params("INBOX")).expect("enqueue");

        let err = store.record_progress(&job_id, 1, None).expect_err("pending");
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        let err = store
            .append_event(&job_id, EventLevel::Info, "early", json!({}))
            .expect_err("pending");
        assert!(matches!(err, AppError::InvalidTransition { .. }));

        store.claim_next("w").expect("claim");
        store.finish(&job_id, JobStatus::Completed, None).expect("finish");

        let err = store.finish(&job_id, JobStatus::Failed, Some("late")).expect_err("terminal");
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        let err = store.record_progress("missing", 1, None).expect_err("missing");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn finish_rejects_non_terminal_status_and_unrequested_cancel() {
        let store = store();
        let job_id = store.enqueue(JobType::Sync, sync_params("INBOX")).expect("enqueue");
        store.claim_next("w").expect("claim");

        let err = store.finish(&job_id, JobStatus::Pending, None).expect_err("non-terminal");
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        let err = store.finish(&job_id, JobStatus::Cancelled, None).expect_err("not requested");
        assert!(err.to_string().contains("cancel was never requested"));

        assert!(store.request_cancel(&job_id).expect("cancel"));
        assert!(store.request_cancel(&job_id).expect("idempotent"));
        store.finish(&job_id, JobStatus::Cancelled, Some("ignored")).expect("finish");

        let job = store.get_job(&job_id).expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.cancel_requested);
        assert!(job.error.is_none());
        assert!(job.finished_at.is_some());
        assert!(store.is_cancel_requested(&job_id).expect("flag"));
    }

    #[test]
    fn request_cancel_leaves_terminal_jobs_alone() {
        let store = store();
        let job_id = store.enqueue(JobType::Sync, sync_params("INBOX")).expect("enqueue");
        store.claim_next("w").expect("claim");
        store.finish(&job_id, JobStatus::Failed, Some("boom")).expect("finish");

        assert!(!store.request_cancel(&job_id).expect("cancel"));
        let err = store.request_cancel("nope").expect_err("missing");
        assert!(matches!(err, AppError::NotFound(_)));
        let job = store.get_job(&job_id).expect("get").expect("job");
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn unique_enqueue_collapses_pending_but_allows_one_follow_up() {
        let store = store();
        let first = store
            .enqueue_unique(JobType::Sync, sync_params("INBOX"), "sync:INBOX")
            .expect("enqueue");
        let again = store
            .enqueue_unique(JobType::Sync, sync_params("INBOX"), "sync:INBOX")
            .expect("enqueue");
        assert!(first.is_new());
        assert!(!again.is_new());
        assert_eq!(first.job_id(), again.job_id());

        store.claim_next("w").expect("claim");
        let follow_up = store
            .enqueue_unique(JobType::Sync, sync_params("INBOX"), "sync:INBOX")
            .expect("enqueue");
        assert!(follow_up.is_new());
        let dup = store
            .enqueue_unique(JobType::Sync, sync_params("INBOX"), "sync:INBOX")
            .expect("enqueue");
        assert_eq!(dup.job_id(), follow_up.job_id());

        let other = store
            .enqueue_unique(JobType::Sync, sync_params("Archive"), "sync:Archive")
            .expect("enqueue");
        assert!(other.is_new());
        assert_eq!(store.status_counts().expect("counts").pending, 2);
    }

    #[test]
    fn event_tail_respects_watermark_and_order() {
        let store = store();
        let job_id = store.enqueue(JobType::Sync, sync_params("INBOX")).expect("enqueue");
        store.claim_next("w").expect("claim");
        let ids: Vec<i64> = (0..5)
            .map(|i| {
                let message = format!("step {i}");
                store
                    .append_event(&job_id, EventLevel::Info, &message, json!({ "i": i }))
                    .expect("append")
            })
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let tail = store.list_events(&job_id, ids[1], 100).expect("list");
        assert_eq!(tail.len(), 3);
        assert!(tail.iter().all(|e| e.id > ids[1]));
        assert_eq!(tail[0].message, "step 2");
        assert_eq!(tail[2].data, json!({ "i": 4 }));

        let limited = store.list_events(&job_id, 0, 2).expect("list");
        assert_eq!(limited.iter().map(|e| e.id).collect::<Vec<_>>(), ids[..2]);
    }

    #[test]
    fn recovery_fails_orphaned_running_jobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("jobs.db");
        let (running, pending) = {
            let store = JobStore::open(&path).expect("open");
            let running = store.enqueue(JobType::Sync, sync_params("A")).expect("enqueue");
            store.claim_next("w").expect("claim");
            let pending = store.enqueue(JobType::Sync, sync_params("B")).expect("enqueue");
            (running, pending)
        };

        let store = JobStore::open(&path).expect("reopen");
        assert_eq!(store.recover_interrupted().expect("recover"), vec![running.clone()]);

        let job = store.get_job(&running).expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(INTERRUPTED_ERROR));
        assert!(job.finished_at.is_some());
        let events = store.list_events(&running, 0, 10).expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, EventLevel::Error);

        let untouched = store.get_job(&pending).expect("get").expect("job");
        assert_eq!(untouched.status, JobStatus::Pending);
    }

    #[test]
    fn prune_removes_old_terminal_jobs_and_their_events() {
        let store = store();
        let done = store.enqueue(JobType::Sync, sync_params("A")).expect("enqueue");
        store.claim_next("w").expect("claim");
        store
            .append_event(&done, EventLevel::Info, "hello", json!({}))
            .expect("append");
        store.finish(&done, JobStatus::Completed, None).expect("finish");
        let pending = store.enqueue(JobType::Sync, sync_params("B")).expect("enqueue");

        let past = Utc::now() - ChronoDuration::days(1);
        assert_eq!(store.prune_finished(past).expect("prune"), 0);
        let future = Utc::now() + ChronoDuration::seconds(1);
        assert_eq!(store.prune_finished(future).expect("prune"), 1);
        assert!(store.get_job(&done).expect("get").is_none());
        assert!(store.list_events(&done, 0, 10).expect("events").is_empty());
        assert!(store.get_job(&pending).expect("get").is_some());
    }

    #[test]
    fn rejects_non_object_params() {
        let store = store();
        let err = store.enqueue(JobType::Sync, json!([1, 2])).expect_err("array params");
        assert!(matches!(err, AppError::InvalidInput(_)));
    }
}
