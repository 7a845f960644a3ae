//! Tail of one job's events as an async stream
//!
//! The feed replays events after a watermark, then follows new ones by
//! polling the store. Status changes are reported as snapshots and the
//! stream ends once the terminal snapshot has been delivered. A heartbeat is
//! emitted when nothing else was sent within the heartbeat interval.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::time::Instant;

use crate::errors::{AppError, AppResult};
use crate::jobs::{Job, JobEvent, JobStatus, JobStore};

/// Current progress of a job as carried on the feed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub processed: u64,
    pub total_estimate: Option<u64>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobStatusSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            status: job.status,
            processed: job.processed,
            total_estimate: job.total_estimate,
            error: job.error.clone(),
            finished_at: job.finished_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedItem {
    JobEvent(JobEvent),
    JobStatus(JobStatusSnapshot),
    Heartbeat {
        job_id: String,
        at: DateTime<Utc>,
        last_event_id: i64,
    },
}

impl FeedItem {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobEvent(_) => "job_event",
            Self::JobStatus(_) => "job_status",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Event id usable as a resume watermark
    pub fn event_id(&self) -> Option<i64> {
        match self {
            Self::JobEvent(event) => Some(event.id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FeedSettings {
    pub poll_interval: Duration,
    pub heartbeat: Duration,
    /// Events read per store query
    pub batch: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(750),
            heartbeat: Duration::from_secs(15),
            batch: 200,
        }
    }
}

struct FeedState {
    store: Arc<JobStore>,
    job_id: String,
    after_id: i64,
    settings: FeedSettings,
    buffered: VecDeque<FeedItem>,
    last_status: Option<JobStatusSnapshot>,
    last_emit: Instant,
    done: bool,
}

impl FeedState {
    /// Read the job, then its new events
    ///
    /// Reading the job first means a terminal status seen here is never
    /// ahead of the events returned after it.
    fn refill(&mut self) -> AppResult<()> {
        let job = self
            .store
            .get_job(&self.job_id)?
            .ok_or_else(|| AppError::NotFound(format!("job '{}'", self.job_id)))?;

        let events = self
            .store
            .list_events(&self.job_id, self.after_id, self.settings.batch)?;
        let more_pending = events.len() >= self.settings.batch;
        if let Some(last) = events.last() {
            self.after_id = last.id;
        }
        self.buffered.extend(events.into_iter().map(FeedItem::JobEvent));
        if more_pending {
            return Ok(());
        }

        let snapshot = JobStatusSnapshot::from(&job);
        if self.last_status.as_ref() != Some(&snapshot) {
            self.buffered.push_back(FeedItem::JobStatus(snapshot.clone()));
            self.last_status = Some(snapshot);
        }
        if job.status.is_terminal() {
            self.done = true;
        }
        Ok(())
    }
}

/// Stream of feed items for `job_id`, starting after event `after_id`
///
/// Yields a single `NotFound` error when the job does not exist.
pub fn job_feed(
    store: Arc<JobStore>,
    job_id: String,
    after_id: i64,
    settings: FeedSettings,
) -> impl Stream<Item = AppResult<FeedItem>> + Send + 'static {
    let state = FeedState {
        store,
        job_id,
        after_id,
        settings,
        buffered: VecDeque::new(),
        last_status: None,
        last_emit: Instant::now(),
        done: false,
    };
    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.buffered.pop_front() {
                st.last_emit = Instant::now();
                return Some((Ok(item), st));
            }
            if st.done {
                return None;
            }
            if let Err(e) = st.refill() {
                st.done = true;
                return Some((Err(e), st));
            }
            if !st.buffered.is_empty() || st.done {
                continue;
            }

            let since = st.last_emit.elapsed();
            if since >= st.settings.heartbeat {
                st.buffered.push_back(FeedItem::Heartbeat {
                    job_id: st.job_id.clone(),
                    at: Utc::now(),
                    last_event_id: st.after_id,
                });
                continue;
            }
            let wait = st.settings.poll_interval.min(st.settings.heartbeat - since);
            tokio::time::sleep(wait).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::pin::pin;
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;
    use serde_json::json;

    use super::{FeedItem, FeedSettings, job_feed};
    use crate::errors::AppError;
    use crate::jobs::{EventLevel, JobStatus, JobStore, JobType};

    const SETTINGS: FeedSettings = FeedSettings {
        poll_interval: Duration::from_millis(100),
        heartbeat: Duration::from_secs(5),
        batch: 2,
    };

    fn running_job(store: &JobStore) -> String {
        let id = store.enqueue(JobType::Sync, json!({ "folder": "INBOX" })).expect("enqueue");
        store.claim_next("w1").expect("claim").expect("job");
        id
    }

    #[tokio::test]
    async fn replays_finished_job_then_ends() {
        let store = Arc::new(JobStore::in_memory().expect("store"));
        let id = running_job(&store);
        for i in 0..3 {
            store
                .append_event(&id, EventLevel::Info, &format!("step {i}"), json!({}))
                .expect("event");
        }
        store.record_progress(&id, 3, Some(3)).expect("progress");
        store.finish(&id, JobStatus::Completed, None).expect("finish");

        let items: Vec<FeedItem> = job_feed(Arc::clone(&store), id.clone(), 0, SETTINGS)
            .map(|item| item.expect("item"))
            .collect()
            .await;
        let kinds: Vec<&str> = items.iter().map(FeedItem::kind).collect();
        assert_eq!(kinds, vec!["job_event", "job_event", "job_event", "job_status"]);
        let ids: Vec<i64> = items.iter().filter_map(FeedItem::event_id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        match items.last().expect("status") {
            FeedItem::JobStatus(snapshot) => {
                assert_eq!(snapshot.status, JobStatus::Completed);
                assert_eq!(snapshot.processed, 3);
                assert!(snapshot.finished_at.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn resumes_after_watermark() {
        let store = Arc::new(JobStore::in_memory().expect("store"));
        let id = running_job(&store);
        let first = store
            .append_event(&id, EventLevel::Info, "one", json!({}))
            .expect("event");
        store
            .append_event(&id, EventLevel::Info, "two", json!({}))
            .expect("event");
        store.finish(&id, JobStatus::Failed, Some("boom")).expect("finish");

        let items: Vec<FeedItem> = job_feed(Arc::clone(&store), id, first, SETTINGS)
            .map(|item| item.expect("item"))
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        match &items[0] {
            FeedItem::JobEvent(event) => assert_eq!(event.message, "two"),
            other => panic!("unexpected {other:?}"),
        }
        match &items[1] {
            FeedItem::JobStatus(snapshot) => assert_eq!(snapshot.error.as_deref(), Some("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn follows_live_job_with_heartbeats() {
        let store = Arc::new(JobStore::in_memory().expect("store"));
        let id = running_job(&store);
        let mut feed = pin!(job_feed(Arc::clone(&store), id.clone(), 0, SETTINGS));

        let first = feed.next().await.expect("item").expect("ok");
        assert!(matches!(first, FeedItem::JobStatus(ref s) if s.status == JobStatus::Running));

        let beat = feed.next().await.expect("item").expect("ok");
        match beat {
            FeedItem::Heartbeat { job_id, last_event_id, .. } => {
                assert_eq!(job_id, id);
                assert_eq!(last_event_id, 0);
            }
            other => panic!("unexpected {other:?}"),
        }

        store
            .append_event(&id, EventLevel::Warn, "late", json!({}))
            .expect("event");
        let late = feed.next().await.expect("item").expect("ok");
        assert_eq!(late.kind(), "job_event");

        store.record_progress(&id, 1, Some(5)).expect("progress");
        let changed = feed.next().await.expect("item").expect("ok");
        assert!(matches!(changed, FeedItem::JobStatus(ref s) if s.processed == 1));
        store.finish(&id, JobStatus::Completed, None).expect("finish");
        let last = feed.next().await.expect("item").expect("ok");
        assert!(matches!(last, FeedItem::JobStatus(ref s) if s.status == JobStatus::Completed));
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn unknown_job_yields_not_found() {
        let store = Arc::new(JobStore::in_memory().expect("store"));
        let items: Vec<_> = job_feed(store, "missing".to_owned(), 0, SETTINGS).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(AppError::NotFound(_))));
    }

    #[test]
    fn items_serialize_with_type_tag() {
        let item = FeedItem::Heartbeat {
            job_id: "j".to_owned(),
            at: chrono::Utc::now(),
            last_event_id: 4,
        };
        let value = serde_json::to_value(&item).expect("serialize");
        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["last_event_id"], 4);
    }
}
