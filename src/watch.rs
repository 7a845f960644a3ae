//! Dedicated per-folder watcher using IMAP IDLE
//!
//! Each monitor owns one connection outside the pool and runs on its own OS
//! thread with a single-threaded runtime, so a long IDLE never competes with
//! job execution. Changes are handed to the main runtime only through the
//! folder's [`TriggerSlot`]; the monitor never touches job rows.

use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coalesce::{TriggerReason, TriggerSlot};
use crate::errors::{AppError, AppResult};
use crate::protocol::{ChangeKind, Connector, FolderStatus, MailConnection};

/// How the monitor is currently learning about changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchMode {
    Idle,
    Poll,
}

impl WatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Poll => "poll",
        }
    }
}

/// Observable state of one monitor
#[derive(Debug, Clone, Default, Serialize)]
pub struct WatchState {
    pub folder: String,
    pub connected: bool,
    pub mode: Option<WatchMode>,
    pub notifications: u64,
    pub reconnect_attempts: u64,
    pub last_notification_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

pub type SharedWatchState = Arc<Mutex<WatchState>>;

fn lock_state(state: &SharedWatchState) -> MutexGuard<'_, WatchState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy)]
pub struct WatchSettings {
    /// IDLE is re-issued after this long without news
    pub idle_timeout: Duration,
    /// EXAMINE interval when the server lacks IDLE
    pub poll_interval: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

/// Exponential reconnect delay: `base * 2^attempt`, capped at `max`
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(31));
    base.saturating_mul(factor).min(max)
}

/// Changes implied by two consecutive EXAMINE results
///
/// `None` means nothing moved. `Some(vec![])` means only flags changed.
pub fn poll_changes(prev: &FolderStatus, next: &FolderStatus) -> Option<Vec<ChangeKind>> {
    if prev.uidvalidity != next.uidvalidity {
        return Some(vec![ChangeKind::MessageAdded, ChangeKind::MessageRemoved]);
    }
    let grown = match (prev.uid_next, next.uid_next) {
        (Some(before), Some(after)) => after.saturating_sub(before),
        _ => next.exists.saturating_sub(prev.exists),
    };
    let mut kinds = Vec::new();
    if grown > 0 {
        kinds.push(ChangeKind::MessageAdded);
    }
    if prev.exists.saturating_add(grown) > next.exists {
        kinds.push(ChangeKind::MessageRemoved);
    }
    if kinds.is_empty() && prev.highest_modseq == next.highest_modseq {
        return None;
    }
    Some(kinds)
}

pub struct WatchMonitor<C: Connector> {
    connector: Arc<C>,
    slot: Arc<TriggerSlot>,
    state: SharedWatchState,
    settings: WatchSettings,
}

impl<C: Connector> WatchMonitor<C> {
    pub fn new(connector: Arc<C>, slot: Arc<TriggerSlot>, settings: WatchSettings) -> Self {
        let state = Arc::new(Mutex::new(WatchState {
            folder: slot.folder().to_owned(),
            ..WatchState::default()
        }));
        Self {
            connector,
            slot,
            state,
            settings,
        }
    }

    pub fn state(&self) -> SharedWatchState {
        Arc::clone(&self.state)
    }

    /// Run the monitor on a named OS thread with its own runtime
    pub fn spawn_dedicated(self, shutdown: CancellationToken) -> AppResult<JoinHandle<()>> {
        let name = format!("watch-{}", self.slot.folder());
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let folder = self.slot.folder();
                        error!(folder, error = %e, "failed to build watch runtime");
                        return;
                    }
                };
                runtime.block_on(self.run(shutdown));
            })
            .map_err(|e| AppError::Internal(format!("failed to spawn watch thread: {e}")))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let folder = self.slot.folder().to_owned();
        let mut failures: u32 = 0;
        let mut lost = false;
        info!(folder, "watch monitor started");
        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.watch_session(&mut lost, &mut failures) => r,
            };
            let Err(e) = result;

            let delay = reconnect_delay(
                failures,
                self.settings.base_backoff,
                self.settings.max_backoff,
            );
            failures = failures.saturating_add(1);
            lost = true;
            {
                let mut state = lock_state(&self.state);
                state.connected = false;
                state.reconnect_attempts += 1;
                state.last_error = Some(e.to_string());
                state.last_error_at = Some(Utc::now());
            }
            warn!(
                folder,
                error = %e,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "watch connection lost; reconnecting"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        lock_state(&self.state).connected = false;
        info!(folder, "watch monitor stopped");
    }

    /// One connection's lifetime; only returns on failure
    async fn watch_session(&self, lost: &mut bool, failures: &mut u32) -> AppResult<Infallible> {
        let folder = self.slot.folder();
        let mut conn = self.connector.connect().await?;
        let mut status = conn.examine(folder).await?;
        let mode = if conn.supports_idle() {
            WatchMode::Idle
        } else {
            WatchMode::Poll
        };
        *failures = 0;
        {
            let mut state = lock_state(&self.state);
            state.connected = true;
            state.mode = Some(mode);
        }
        if *lost {
            *lost = false;
            info!(folder, "watch reconnected; requesting catch-up sync");
            self.slot.raise(TriggerReason::Reconnected, &[]);
        }

        match mode {
            WatchMode::Idle => loop {
                let kinds = conn.idle(self.settings.idle_timeout).await?;
                if kinds.is_empty() {
                    debug!(folder, "IDLE refresh");
                    continue;
                }
                self.record_notification();
                debug!(folder, ?kinds, "IDLE notification");
                self.slot.raise(TriggerReason::IdleNotification, &kinds);
            },
            WatchMode::Poll => loop {
                tokio::time::sleep(self.settings.poll_interval).await;
                let next = conn.examine(folder).await?;
                if let Some(kinds) = poll_changes(&status, &next) {
                    self.record_notification();
                    debug!(folder, ?kinds, "poll detected changes");
                    self.slot.raise(TriggerReason::PollDiff, &kinds);
                }
                status = next;
            },
        }
    }

    fn record_notification(&self) {
        let mut state = lock_state(&self.state);
        state.notifications += 1;
        state.last_notification_at = Some(Utc::now());
    }
}
