//! Worker pool that claims pending jobs and runs them to completion
//!
//! Each worker reserves a pool slot before claiming, so a job is only taken
//! off the queue when a connection is available for it. The job routine runs
//! in its own task; a panic there is reported as a job failure and the
//! session it held is discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::MailCache;
use crate::errors::{AppError, AppResult};
use crate::folder_sync::{FolderSync, SyncParams, SyncSettings};
use crate::jobs::{EventLevel, Job, JobStatus, JobStore, JobType};
use crate::mutation::{MutationBatch, MutationParams};
use crate::pool::{ConnectionPool, PooledConnection, Reservation};
use crate::protocol::{Connector, FolderStatus, MailConnection};

/// Result of a job routine that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed { summary: String, data: Value },
    /// The routine observed a cancel request at a batch boundary
    Cancelled,
}

/// Handle a routine uses to report on the job it runs
///
/// All writes go through the store's running-state guard.
#[derive(Clone)]
pub struct JobContext {
    store: Arc<JobStore>,
    job_id: Arc<str>,
}

impl JobContext {
    pub fn new(store: Arc<JobStore>, job_id: &str) -> Self {
        Self {
            store,
            job_id: Arc::from(job_id),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cancel_requested(&self) -> AppResult<bool> {
        self.store.is_cancel_requested(&self.job_id)
    }

    pub fn progress(&self, delta: u64, total_estimate: Option<u64>) -> AppResult<()> {
        self.store.record_progress(&self.job_id, delta, total_estimate)
    }

    pub fn event(&self, level: EventLevel, message: &str, data: Value) -> AppResult<i64> {
        self.store.append_event(&self.job_id, level, message, data)
    }
}

/// Replace a failed session and reopen `folder` on the new one
pub async fn renew_and_open<C: Connector>(
    pool: &ConnectionPool<C>,
    ctx: &JobContext,
    conn: &mut PooledConnection<C::Connection>,
    folder: &str,
    read_write: bool,
    cause: &AppError,
) -> AppResult<FolderStatus> {
    warn!(
        job_id = ctx.job_id(),
        folder,
        error = %cause,
        "session failed; retrying on a fresh connection"
    );
    ctx.event(
        EventLevel::Warn,
        &format!("Connection lost ({cause}); retrying once"),
        json!({ "code": cause.code() }),
    )?;
    pool.renew(conn).await?;
    let session = conn.session()?;
    if read_write {
        session.select(folder).await
    } else {
        session.examine(folder).await
    }
}

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub workers: usize,
    pub poll_interval: Duration,
    pub sync: SyncSettings,
    pub write_enabled: bool,
}

/// Live executor counters
#[derive(Debug, Default)]
pub struct ExecutorGauges {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutorSnapshot {
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl ExecutorGauges {
    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ExecutorSnapshot {
        ExecutorSnapshot {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            max_in_flight: self.max_in_flight.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            cancelled: self.cancelled.load(Ordering::SeqCst),
        }
    }
}

pub struct Executor<C: Connector> {
    store: Arc<JobStore>,
    cache: Arc<MailCache>,
    pool: Arc<ConnectionPool<C>>,
    settings: ExecutorSettings,
    gauges: Arc<ExecutorGauges>,
}

impl<C: Connector> Executor<C> {
    pub fn new(
        store: Arc<JobStore>,
        cache: Arc<MailCache>,
        pool: Arc<ConnectionPool<C>>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            cache,
            pool,
            settings,
            gauges: Arc::new(ExecutorGauges::default()),
        }
    }

    pub fn gauges(&self) -> Arc<ExecutorGauges> {
        Arc::clone(&self.gauges)
    }

    /// Start `settings.workers` worker loops on `tasks`
    pub fn spawn_workers(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        run_tag: &str,
        shutdown: &CancellationToken,
    ) {
        for index in 0..self.settings.workers {
            let worker_id = format!("worker-{index}-{run_tag}");
            tasks.spawn(Arc::clone(self).worker_loop(worker_id, shutdown.clone()));
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String, shutdown: CancellationToken) {
        debug!(worker = %worker_id, "worker started");
        loop {
            let reserved = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.pool.reserve() => r,
            };
            let reservation = match reserved {
                Ok(reservation) => reservation,
                Err(e) => {
                    warn!(worker = %worker_id, error = %e, "no pooled connection; deferring claim");
                    continue;
                }
            };

            match self.store.claim_next(&worker_id) {
                Ok(Some(job)) => self.execute(&worker_id, job, reservation).await,
                Ok(None) => {
                    drop(reservation);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.store.wait_for_work(self.settings.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(reservation);
                    error!(worker = %worker_id, error = %e, "claim failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    }
                }
            }
        }
        debug!(worker = %worker_id, "worker stopped");
    }

    async fn execute(self: &Arc<Self>, worker_id: &str, job: Job, reservation: Reservation) {
        let ctx = JobContext::new(Arc::clone(&self.store), &job.job_id);
        info!(
            job_id = %job.job_id,
            worker = worker_id,
            job_type = job.job_type.as_str(),
            "job started"
        );
        log_store_error(
            &ctx,
            ctx.event(
                EventLevel::Info,
                &start_message(&job),
                json!({ "worker_id": worker_id, "params": job.params }),
            ),
        );

        let conn = match self.pool.checkout(reservation).await {
            Ok(conn) => conn,
            Err(e) => {
                self.settle(&ctx, Err(e));
                return;
            }
        };

        self.gauges.enter();
        let this = Arc::clone(self);
        let task_ctx = ctx.clone();
        let joined = tokio::spawn(async move {
            let mut conn = conn;
            let result = this.run_routine(&task_ctx, &job, &mut conn).await;
            (result, conn)
        })
        .await;
        self.gauges.leave();

        let result = match joined {
            Ok((result, conn)) => {
                match &result {
                    Err(e) if e.is_connection_error() => self.pool.release_broken(conn),
                    _ => self.pool.release(conn),
                }
                result
            }
            Err(e) => Err(AppError::Internal(format!("job routine panicked: {e}"))),
        };
        self.settle(&ctx, result);
    }

    async fn run_routine(
        &self,
        ctx: &JobContext,
        job: &Job,
        conn: &mut PooledConnection<C::Connection>,
    ) -> AppResult<Outcome> {
        // cancelled while pending
        if ctx.cancel_requested()? {
            return Ok(Outcome::Cancelled);
        }
        match job.job_type {
            JobType::Sync => {
                let params: SyncParams = serde_json::from_value(job.params.clone())
                    .map_err(|e| AppError::InvalidInput(format!("invalid sync params: {e}")))?;
                FolderSync::new(&self.pool, &self.cache, self.settings.sync)
                    .run(ctx, conn, &params)
                    .await
            }
            JobType::MutationBatch => {
                if !self.settings.write_enabled {
                    return Err(AppError::InvalidInput(
                        "write operations are disabled; set MAIL_IMAP_WRITE_ENABLED=true"
                            .to_owned(),
                    ));
                }
                let params: MutationParams = serde_json::from_value(job.params.clone())
                    .map_err(|e| AppError::InvalidInput(format!("invalid mutation params: {e}")))?;
                MutationBatch::new(&self.pool, &self.cache)
                    .run(ctx, conn, &params)
                    .await
            }
        }
    }

    /// Record the routine's result and move the job to its terminal status
    fn settle(&self, ctx: &JobContext, result: AppResult<Outcome>) {
        let job_id = ctx.job_id();
        match result {
            Ok(Outcome::Completed { summary, data }) => {
                log_store_error(ctx, ctx.event(EventLevel::Info, &summary, data));
                log_store_error(ctx, self.store.finish(job_id, JobStatus::Completed, None));
                self.gauges.completed.fetch_add(1, Ordering::SeqCst);
                info!(job_id, summary = %summary, "job completed");
            }
            Ok(Outcome::Cancelled) => {
                log_store_error(
                    ctx,
                    ctx.event(EventLevel::Warn, "Job cancelled", json!({})),
                );
                log_store_error(ctx, self.store.finish(job_id, JobStatus::Cancelled, None));
                self.gauges.cancelled.fetch_add(1, Ordering::SeqCst);
                info!(job_id, "job cancelled");
            }
            Err(e @ AppError::InvalidTransition { .. }) => {
                warn!(job_id, error = %e, "job left running state under its worker; abandoning");
            }
            Err(e) => {
                let message = e.to_string();
                log_store_error(
                    ctx,
                    ctx.event(
                        EventLevel::Error,
                        &format!("Job failed: {message}"),
                        json!({ "code": e.code() }),
                    ),
                );
                log_store_error(ctx, self.store.finish(job_id, JobStatus::Failed, Some(&message)));
                self.gauges.failed.fetch_add(1, Ordering::SeqCst);
                error!(job_id, code = e.code(), error = %message, "job failed");
            }
        }
    }
}

fn log_store_error<T>(ctx: &JobContext, result: AppResult<T>) {
    if let Err(e) = result {
        error!(job_id = ctx.job_id(), error = %e, "job store write failed");
    }
}

fn start_message(job: &Job) -> String {
    let folder = job
        .params
        .get("folder")
        .and_then(Value::as_str)
        .unwrap_or("?");
    match job.job_type {
        JobType::Sync => {
            let reasons: Vec<&str> = job
                .params
                .pointer("/trigger/reasons")
                .and_then(Value::as_array)
                .map(|r| r.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if reasons.is_empty() {
                format!("Sync of {folder} started")
            } else {
                format!("Sync of {folder} started (triggered by {})", reasons.join(", "))
            }
        }
        JobType::MutationBatch => {
            let count = job
                .params
                .get("uids")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            format!("Mutation batch of {count} message(s) in {folder} started")
        }
    }
}
