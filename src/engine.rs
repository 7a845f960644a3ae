//! Engine lifecycle and the handle used by the API surfaces
//!
//! [`Engine::start`] wires the job store, pool, executor, scheduler and
//! watch monitors together; [`Engine::shutdown`] stops them cooperatively.
//! [`EngineHandle`] is the cloneable entry point for enqueueing, reading
//! and cancelling jobs.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::MailCache;
use crate::coalesce::{Coalescer, TriggerSlot};
use crate::config::EngineConfig;
use crate::errors::{AppError, AppResult};
use crate::executor::{Executor, ExecutorGauges, ExecutorSettings, ExecutorSnapshot};
use crate::feed::{FeedItem, FeedSettings, job_feed};
use crate::folder_sync::{SyncMode, SyncParams, SyncSettings, SyncTrigger, sync_dedupe_key};
use crate::jobs::{Enqueued, Job, JobEvent, JobStatus, JobStore, JobType, StatusCounts};
use crate::mutation::MutationParams;
use crate::pool::{ConnectionPool, PoolHandle, PoolSnapshot};
use crate::protocol::Connector;
use crate::scheduler::Scheduler;
use crate::watch::{SharedWatchState, WatchMonitor, WatchSettings, WatchState};

/// Maximum jobs returned by one listing
pub const MAX_LIST_LIMIT: usize = 500;
/// Maximum events returned by one page
pub const MAX_EVENT_PAGE: usize = 1_000;

/// Point-in-time view of the whole engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub write_enabled: bool,
    pub folders: Vec<String>,
    pub jobs: StatusCounts,
    pub pool: PoolSnapshot,
    pub executor: ExecutorSnapshot,
    pub watches: Vec<WatchState>,
}

/// Cloneable access to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    store: Arc<JobStore>,
    folders: Arc<[String]>,
    write_enabled: bool,
    feed: FeedSettings,
    pool: Arc<dyn PoolHandle>,
    executor: Arc<ExecutorGauges>,
    watches: Arc<[SharedWatchState]>,
    started_at: DateTime<Utc>,
}

impl EngineHandle {
    /// Queue a sync of `folder`
    ///
    /// Incremental requests share the folder's pending slot; full requests
    /// always get their own job.
    pub fn enqueue_sync(&self, folder: &str, mode: SyncMode) -> AppResult<Enqueued> {
        validate_folder(folder)?;
        let params = SyncParams {
            folder: folder.to_owned(),
            mode,
            trigger: Some(SyncTrigger {
                reasons: vec!["manual".to_owned()],
                ..SyncTrigger::default()
            }),
        };
        let value = serde_json::to_value(&params)?;
        match mode {
            SyncMode::Full => Ok(Enqueued::New(self.store.enqueue(JobType::Sync, value)?)),
            SyncMode::Incremental => {
                self.store
                    .enqueue_unique(JobType::Sync, value, &sync_dedupe_key(folder))
            }
        }
    }

    pub fn enqueue_mutation(&self, params: &MutationParams) -> AppResult<String> {
        if !self.write_enabled {
            return Err(AppError::InvalidInput(
                "write operations are disabled; set MAIL_IMAP_WRITE_ENABLED=true".to_owned(),
            ));
        }
        validate_folder(&params.folder)?;
        if let Some(dest) = &params.move_to {
            validate_folder(dest)?;
        }
        params.validate()?;
        self.store
            .enqueue(JobType::MutationBatch, serde_json::to_value(params)?)
    }

    pub fn get_job(&self, job_id: &str) -> AppResult<Job> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| AppError::NotFound(format!("job '{job_id}'")))
    }

    pub fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> AppResult<Vec<Job>> {
        self.store.list_jobs(status, limit.clamp(1, MAX_LIST_LIMIT))
    }

    /// Events of an existing job after the `after_id` watermark
    pub fn events(&self, job_id: &str, after_id: i64, limit: usize) -> AppResult<Vec<JobEvent>> {
        self.get_job(job_id)?;
        self.store
            .list_events(job_id, after_id.max(0), limit.clamp(1, MAX_EVENT_PAGE))
    }

    /// Request cooperative cancellation
    ///
    /// # Errors
    ///
    /// - `NotFound` for unknown jobs
    /// - `Conflict` when the job already finished
    pub fn cancel(&self, job_id: &str) -> AppResult<Job> {
        let job = self.get_job(job_id)?;
        if !self.store.request_cancel(job_id)? {
            return Err(AppError::Conflict(format!(
                "job '{job_id}' already {}",
                job.status
            )));
        }
        info!(job_id, "cancel requested");
        self.get_job(job_id)
    }

    pub fn status(&self) -> AppResult<EngineStatus> {
        let now = Utc::now();
        Ok(EngineStatus {
            started_at: self.started_at,
            uptime_seconds: u64::try_from((now - self.started_at).num_seconds()).unwrap_or(0),
            write_enabled: self.write_enabled,
            folders: self.folders.to_vec(),
            jobs: self.store.status_counts()?,
            pool: self.pool.snapshot(),
            executor: self.executor.snapshot(),
            watches: self
                .watches
                .iter()
                .map(|state| match state.lock() {
                    Ok(guard) => guard.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                })
                .collect(),
        })
    }

    /// Live feed of a job's events; fails fast for unknown jobs
    pub fn feed(
        &self,
        job_id: &str,
        after_id: i64,
    ) -> AppResult<impl Stream<Item = AppResult<FeedItem>> + Send + 'static + use<>> {
        self.get_job(job_id)?;
        Ok(job_feed(
            Arc::clone(&self.store),
            job_id.to_owned(),
            after_id.max(0),
            self.feed,
        ))
    }
}

/// A running engine
pub struct Engine {
    handle: EngineHandle,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
    watch_threads: Vec<JoinHandle<()>>,
    pool: Arc<dyn PoolHandle>,
}

/// Startup switches not carried by [`EngineConfig`]
#[derive(Debug, Clone, Copy)]
pub struct StartOptions {
    pub watch: bool,
}

impl Engine {
    /// Open storage, recover, and start every background component
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<C: Connector>(
        config: &EngineConfig,
        connector: Arc<C>,
        options: StartOptions,
    ) -> AppResult<Self> {
        config.validate()?;
        let store = Arc::new(JobStore::open(&config.db_path)?);
        let cache = Arc::new(MailCache::open(&config.db_path)?);

        let recovered = store.recover_interrupted()?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "failed jobs interrupted by the previous run");
        }

        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let run_tag: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();

        let pool = Arc::new(ConnectionPool::new(
            Arc::clone(&connector),
            config.pool_size,
            config.pool_acquire_timeout(),
        ));
        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&pool),
            ExecutorSettings {
                workers: config.workers,
                poll_interval: config.poll_interval(),
                sync: SyncSettings {
                    batch_size: config.batch_size,
                    body_batch_size: config.body_batch_size,
                    max_body_bytes: config.max_body_bytes,
                },
                write_enabled: config.write_enabled,
            },
        ));
        executor.spawn_workers(&mut tasks, &run_tag, &shutdown);

        let scheduler = Scheduler::new(
            Arc::clone(&store),
            config.folders.clone(),
            config.catchup_interval(),
            config.job_retention(),
        );
        scheduler.enqueue_initial()?;
        tasks.spawn(scheduler.run(shutdown.clone()));

        let mut watches = Vec::new();
        let mut watch_threads = Vec::new();
        if options.watch {
            let settings = WatchSettings {
                idle_timeout: config.idle_timeout(),
                poll_interval: config.watch_poll_interval(),
                base_backoff: Duration::from_secs(1),
                max_backoff: config.watch_max_backoff(),
            };
            for folder in &config.watch_folders {
                let slot = TriggerSlot::new(folder);
                let coalescer =
                    Coalescer::new(Arc::clone(&store), Arc::clone(&slot), config.debounce_window());
                tasks.spawn(coalescer.run(shutdown.clone()));

                let monitor = WatchMonitor::new(Arc::clone(&connector), slot, settings);
                watches.push(monitor.state());
                match monitor.spawn_dedicated(shutdown.clone()) {
                    Ok(thread) => watch_threads.push(thread),
                    Err(e) => {
                        shutdown.cancel();
                        return Err(e);
                    }
                }
            }
        }

        info!(
            run = %run_tag,
            workers = config.workers,
            pool_size = config.pool_size,
            folders = config.folders.len(),
            watched = watch_threads.len(),
            "engine started"
        );

        let pool: Arc<dyn PoolHandle> = pool;
        let handle = EngineHandle {
            store,
            folders: config.folders.clone().into(),
            write_enabled: config.write_enabled,
            feed: FeedSettings {
                heartbeat: config.feed_heartbeat(),
                ..FeedSettings::default()
            },
            pool: Arc::clone(&pool),
            executor: executor.gauges(),
            watches: watches.into(),
            started_at: Utc::now(),
        };
        Ok(Self {
            handle,
            shutdown,
            tasks,
            watch_threads,
            pool,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Stop claiming, let in-flight jobs finish, and join every component
    pub async fn shutdown(mut self) {
        info!("engine shutting down");
        self.shutdown.cancel();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "engine task ended abnormally");
            }
        }
        for thread in self.watch_threads.drain(..) {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => error!("watch thread panicked"),
                Err(e) => error!(error = %e, "failed to join watch thread"),
            }
        }
        self.pool.close_idle();
        info!("engine stopped");
    }
}

/// Validate a folder name supplied by a client
pub fn validate_folder(folder: &str) -> AppResult<()> {
    if folder.is_empty() || folder.len() > 256 {
        return Err(AppError::InvalidInput(
            "folder must be 1..256 characters".to_owned(),
        ));
    }
    if folder.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::InvalidInput(
            "folder must not contain control characters".to_owned(),
        ));
    }
    Ok(())
}
