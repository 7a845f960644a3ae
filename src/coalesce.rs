//! Debounced hand-off from watch monitors to the job queue
//!
//! A [`TriggerSlot`] holds at most one pending trigger per folder. Raises
//! while a trigger is pending are merged into it, so a burst of server
//! notifications turns into a single sync job. The slot is written from the
//! watch thread and drained by a [`Coalescer`] task on the main runtime.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::AppResult;
use crate::folder_sync::{SyncMode, SyncParams, SyncTrigger, sync_dedupe_key};
use crate::jobs::{Enqueued, JobStore, JobType};
use crate::protocol::ChangeKind;

/// Why a watch monitor asked for a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    IdleNotification,
    Reconnected,
    PollDiff,
}

impl TriggerReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdleNotification => "idle_notification",
            Self::Reconnected => "reconnected",
            Self::PollDiff => "poll_diff",
        }
    }
}

/// Merged state of every raise since the slot was last taken
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTrigger {
    pub reasons: BTreeSet<TriggerReason>,
    pub kinds: BTreeSet<ChangeKind>,
    pub notifications: u64,
    pub first_raised_at: Instant,
}

impl PendingTrigger {
    pub fn to_sync_trigger(&self) -> SyncTrigger {
        SyncTrigger {
            reasons: self.reasons.iter().map(|r| r.as_str().to_owned()).collect(),
            kinds: self.kinds.iter().map(|k| k.as_str().to_owned()).collect(),
            notifications: self.notifications,
        }
    }
}

/// Single-slot, level-triggered mailbox for one folder
pub struct TriggerSlot {
    folder: String,
    pending: Mutex<Option<PendingTrigger>>,
    notify: Notify,
}

impl TriggerSlot {
    pub fn new(folder: &str) -> Arc<Self> {
        Arc::new(Self {
            folder: folder.to_owned(),
            pending: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    fn pending(&self) -> MutexGuard<'_, Option<PendingTrigger>> {
        // Slot state is a plain value; a panic elsewhere cannot leave it torn
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a trigger, merging into one that is already pending
    pub fn raise(&self, reason: TriggerReason, kinds: &[ChangeKind]) {
        {
            let mut pending = self.pending();
            let entry = pending.get_or_insert_with(|| PendingTrigger {
                reasons: BTreeSet::new(),
                kinds: BTreeSet::new(),
                notifications: 0,
                first_raised_at: Instant::now(),
            });
            entry.reasons.insert(reason);
            entry.kinds.extend(kinds.iter().copied());
            entry.notifications += 1;
        }
        self.notify.notify_one();
    }

    pub fn take(&self) -> Option<PendingTrigger> {
        self.pending().take()
    }

    pub fn is_pending(&self) -> bool {
        self.pending().is_some()
    }

    /// Resolve once a trigger is pending
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_pending() {
                return;
            }
            notified.await;
        }
    }
}

/// Turns raised triggers into deduplicated incremental sync jobs
pub struct Coalescer {
    store: Arc<JobStore>,
    slot: Arc<TriggerSlot>,
    debounce: Duration,
}

impl Coalescer {
    pub fn new(store: Arc<JobStore>, slot: Arc<TriggerSlot>, debounce: Duration) -> Self {
        Self {
            store,
            slot,
            debounce,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let folder = self.slot.folder().to_owned();
        debug!(folder, "coalescer started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.slot.wait() => {}
            }
            // Absorb the rest of the burst
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.debounce) => {}
            }
            if let Err(e) = self.flush() {
                error!(folder, error = %e, "failed to enqueue triggered sync");
            }
        }
        debug!(folder, "coalescer stopped");
    }

    /// Enqueue a sync for whatever is pending in the slot
    pub fn flush(&self) -> AppResult<Option<Enqueued>> {
        let Some(pending) = self.slot.take() else {
            return Ok(None);
        };
        let folder = self.slot.folder();
        let params = SyncParams {
            folder: folder.to_owned(),
            mode: SyncMode::Incremental,
            trigger: Some(pending.to_sync_trigger()),
        };
        let enqueued = self.store.enqueue_unique(
            JobType::Sync,
            serde_json::to_value(&params)?,
            &sync_dedupe_key(folder),
        )?;
        if enqueued.is_new() {
            info!(
                folder,
                job_id = enqueued.job_id(),
                notifications = pending.notifications,
                "triggered sync enqueued"
            );
        } else {
            debug!(folder, job_id = enqueued.job_id(), "trigger merged into pending sync");
        }
        Ok(Some(enqueued))
    }
}
