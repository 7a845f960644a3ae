//! Startup and periodic catch-up scheduling

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::AppResult;
use crate::folder_sync::{SyncMode, SyncParams, SyncTrigger, sync_dedupe_key};
use crate::jobs::{JobStore, JobType};

/// What one catch-up round did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub enqueued: usize,
    pub merged: usize,
    pub pruned: usize,
}

pub struct Scheduler {
    store: Arc<JobStore>,
    folders: Vec<String>,
    catchup_interval: Duration,
    retention: chrono::Duration,
}

fn sync_params(folder: &str, mode: SyncMode, reason: &str) -> SyncParams {
    SyncParams {
        folder: folder.to_owned(),
        mode,
        trigger: Some(SyncTrigger {
            reasons: vec![reason.to_owned()],
            ..SyncTrigger::default()
        }),
    }
}

impl Scheduler {
    pub fn new(
        store: Arc<JobStore>,
        folders: Vec<String>,
        catchup_interval: Duration,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            store,
            folders,
            catchup_interval,
            retention,
        }
    }

    /// One full sync per configured folder
    ///
    /// Not deduplicated: a pending incremental job must not swallow the
    /// full reconciliation.
    pub fn enqueue_initial(&self) -> AppResult<Vec<String>> {
        let mut ids = Vec::with_capacity(self.folders.len());
        for folder in &self.folders {
            let params = sync_params(folder, SyncMode::Full, "startup");
            let job_id = self.store.enqueue(JobType::Sync, serde_json::to_value(&params)?)?;
            debug!(folder, job_id, "startup sync enqueued");
            ids.push(job_id);
        }
        info!(folders = self.folders.len(), "startup syncs enqueued");
        Ok(ids)
    }

    /// Enqueue catch-up syncs and prune old finished jobs
    pub fn tick(&self) -> AppResult<TickReport> {
        let mut report = TickReport::default();
        for folder in &self.folders {
            let params = sync_params(folder, SyncMode::Incremental, "catchup");
            let enqueued = self.store.enqueue_unique(
                JobType::Sync,
                serde_json::to_value(&params)?,
                &sync_dedupe_key(folder),
            )?;
            if enqueued.is_new() {
                report.enqueued += 1;
            } else {
                report.merged += 1;
            }
        }
        report.pruned = self.store.prune_finished(Utc::now() - self.retention)?;
        Ok(report)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval_at(
            Instant::now() + self.catchup_interval,
            self.catchup_interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.tick() {
                Ok(report) => debug!(
                    enqueued = report.enqueued,
                    merged = report.merged,
                    pruned = report.pruned,
                    "catch-up round"
                ),
                Err(e) => error!(error = %e, "catch-up round failed"),
            }
        }
        debug!("scheduler stopped");
    }
}
