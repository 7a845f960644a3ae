//! Input/output DTOs shared by the MCP tools and the HTTP API
//!
//! Timestamps are rendered as RFC 3339 strings so every type here can carry
//! a JSON schema.

use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::EngineStatus;
use crate::executor::ExecutorSnapshot;
use crate::folder_sync::SyncMode;
use crate::jobs::{Enqueued, Job, JobEvent, StatusCounts};
use crate::pool::PoolSnapshot;
use crate::watch::WatchState;

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Metadata included in all tool responses
///
/// Provides timing information and current UTC timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Tool execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: rfc3339(Utc::now()),
            duration_ms,
        }
    }
}

/// Standard response envelope for all tools
///
/// Wraps tool-specific data with human-readable summary and execution metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T>
where
    T: JsonSchema,
{
    /// Human-readable summary of the operation outcome
    pub summary: String,
    /// Tool-specific data payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// Input: enqueue a folder sync
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct EnqueueSyncInput {
    /// Folder to reconcile (e.g., `INBOX`)
    pub folder: String,
    /// `incremental` (default, deduplicated per folder) or `full`
    #[serde(default)]
    pub mode: SyncMode,
}

/// Input: enqueue a bulk flag/move batch
///
/// Requires `MAIL_IMAP_WRITE_ENABLED=true`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct EnqueueMutationInput {
    /// Source folder
    pub folder: String,
    /// UIDs in the source folder (1..10000)
    pub uids: Vec<u32>,
    /// Add `\Seen` to every message
    #[serde(default)]
    pub mark_read: bool,
    /// Move every message to this folder
    pub move_to: Option<String>,
}

/// Input: job id only
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct JobIdInput {
    /// Job identifier returned by an enqueue call
    pub job_id: String,
}

/// Input: list recent jobs
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListJobsInput {
    /// Filter by status (`pending`, `running`, `completed`, `failed`, `cancelled`)
    pub status: Option<String>,
    /// Maximum jobs to return (1..500, default 20)
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

/// Input: read a page of job events
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct TailEventsInput {
    /// Job identifier
    pub job_id: String,
    /// Return events with id greater than this watermark
    #[serde(default)]
    pub after_id: i64,
    /// Maximum events to return (1..1000, default 100)
    #[serde(default = "default_event_limit")]
    pub limit: usize,
}

pub fn default_list_limit() -> usize {
    20
}

pub fn default_event_limit() -> usize {
    100
}

/// Result of an enqueue call
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EnqueuedJob {
    pub job_id: String,
    /// `true` when an equivalent pending job already existed
    pub deduplicated: bool,
}

impl From<&Enqueued> for EnqueuedJob {
    fn from(enqueued: &Enqueued) -> Self {
        Self {
            job_id: enqueued.job_id().to_owned(),
            deduplicated: !enqueued.is_new(),
        }
    }
}

/// Job record
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobView {
    pub job_id: String,
    /// `sync` or `mutation_batch`
    pub job_type: String,
    pub status: String,
    pub params: Value,
    pub dedupe_key: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    /// Identifiers the job expects to process, once planned
    pub total_estimate: Option<u64>,
    pub processed: u64,
    pub cancel_requested: bool,
    pub error: Option<String>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            job_type: job.job_type.as_str().to_owned(),
            status: job.status.as_str().to_owned(),
            params: job.params.clone(),
            dedupe_key: job.dedupe_key.clone(),
            worker_id: job.worker_id.clone(),
            created_at: rfc3339(job.created_at),
            started_at: job.started_at.map(rfc3339),
            finished_at: job.finished_at.map(rfc3339),
            total_estimate: job.total_estimate,
            processed: job.processed,
            cancel_requested: job.cancel_requested,
            error: job.error.clone(),
        }
    }
}

/// Job event record
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobEventView {
    /// Monotonic id, usable as `after_id`
    pub id: i64,
    pub job_id: String,
    pub created_at: String,
    /// `info`, `warn` or `error`
    pub level: String,
    pub message: String,
    pub data: Value,
}

impl From<&JobEvent> for JobEventView {
    fn from(event: &JobEvent) -> Self {
        Self {
            id: event.id,
            job_id: event.job_id.clone(),
            created_at: rfc3339(event.created_at),
            level: event.level.as_str().to_owned(),
            message: event.message.clone(),
            data: event.data.clone(),
        }
    }
}

/// Response data for `imap_list_jobs`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobListData {
    pub jobs: Vec<JobView>,
}

/// Response data for `imap_tail_job_events`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EventPage {
    pub job_id: String,
    pub events: Vec<JobEventView>,
    /// Pass back as `after_id` to continue
    pub next_after_id: i64,
    pub status: String,
    /// `true` once the job is terminal and no events remain after this page
    pub finished: bool,
}

/// Watch monitor state
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WatchView {
    pub folder: String,
    pub connected: bool,
    /// `idle` or `poll`
    pub mode: Option<String>,
    pub notifications: u64,
    pub reconnect_attempts: u64,
    pub last_notification_at: Option<String>,
    pub last_error: Option<String>,
    pub last_error_at: Option<String>,
}

impl From<&WatchState> for WatchView {
    fn from(state: &WatchState) -> Self {
        Self {
            folder: state.folder.clone(),
            connected: state.connected,
            mode: state.mode.map(|m| m.as_str().to_owned()),
            notifications: state.notifications,
            reconnect_attempts: state.reconnect_attempts,
            last_notification_at: state.last_notification_at.map(rfc3339),
            last_error: state.last_error.clone(),
            last_error_at: state.last_error_at.map(rfc3339),
        }
    }
}

/// Response data for `imap_engine_status` and `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EngineStatusView {
    pub started_at: String,
    pub uptime_seconds: u64,
    pub write_enabled: bool,
    pub folders: Vec<String>,
    pub jobs: StatusCounts,
    pub pool: PoolSnapshot,
    pub executor: ExecutorSnapshot,
    pub watches: Vec<WatchView>,
}

impl From<&EngineStatus> for EngineStatusView {
    fn from(status: &EngineStatus) -> Self {
        Self {
            started_at: rfc3339(status.started_at),
            uptime_seconds: status.uptime_seconds,
            write_enabled: status.write_enabled,
            folders: status.folders.clone(),
            jobs: status.jobs.clone(),
            pool: status.pool,
            executor: status.executor,
            watches: status.watches.iter().map(WatchView::from).collect(),
        }
    }
}
