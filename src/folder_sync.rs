//! Folder reconciliation between the server and the local cache
//!
//! One task syncs one folder over one pooled session. Work is split into
//! micro-batches; each batch commits to the cache in a single transaction,
//! reports progress and checks for cancellation before the next one starts.
//! The folder marker is written only after every batch has committed, so an
//! interrupted run is simply redone from the old marker.

use std::collections::{BTreeSet, HashSet};

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cache::{CachedMessage, FolderMarker, MailCache};
use crate::errors::{AppError, AppResult};
use crate::executor::{JobContext, Outcome, renew_and_open};
use crate::jobs::EventLevel;
use crate::mime;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::protocol::{Connector, FolderStatus, MailConnection, RemoteMessage};

/// How much of the folder to reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Full listing; every remote message is refetched
    Full,
    /// Only what changed since the stored marker
    #[default]
    Incremental,
}

/// What caused a sync job to be enqueued
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTrigger {
    /// e.g. `startup`, `catchup`, `idle_notification`, `reconnected`, `manual`
    pub reasons: Vec<String>,
    #[serde(default)]
    pub kinds: Vec<String>,
    #[serde(default)]
    pub notifications: u64,
}

/// Parameters of a `sync` job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncParams {
    pub folder: String,
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default)]
    pub trigger: Option<SyncTrigger>,
}

/// Dedupe key shared by every sync job for `folder`
pub fn sync_dedupe_key(folder: &str) -> String {
    format!("sync:{folder}")
}

/// Batch sizing for sync tasks
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub body_batch_size: usize,
    pub max_body_bytes: u32,
}

/// Counters reported in the completion event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub upserted: usize,
    pub deleted: usize,
    pub batches: usize,
    pub bodies_fetched: usize,
    pub uidvalidity_reset: bool,
    pub unchanged: bool,
}

/// Work computed from the server status and the cache
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    pub fetch: Vec<u32>,
    pub delete: Vec<u32>,
}

/// Whether an incremental run can stop right after EXAMINE
pub fn marker_unchanged(marker: &FolderMarker, status: &FolderStatus) -> bool {
    marker.uidvalidity == status.uidvalidity
        && marker.exists == status.exists
        && marker.uid_next == status.uid_next
        && marker.highest_modseq == status.highest_modseq
}

/// Diff a full remote listing against the cached live UIDs
///
/// `refetch_all` refreshes every remote message instead of only new ones.
pub fn plan_from_listing(remote: &[u32], local: &[u32], refetch_all: bool) -> SyncPlan {
    let remote_set: HashSet<u32> = remote.iter().copied().collect();
    let local_set: HashSet<u32> = local.iter().copied().collect();
    let fetch = remote
        .iter()
        .copied()
        .filter(|uid| refetch_all || !local_set.contains(uid))
        .collect::<BTreeSet<_>>();
    let delete = local
        .iter()
        .copied()
        .filter(|uid| !remote_set.contains(uid))
        .collect::<BTreeSet<_>>();
    SyncPlan {
        fetch: fetch.into_iter().collect(),
        delete: delete.into_iter().collect(),
    }
}

/// Reconciles one folder using one pooled session
pub struct FolderSync<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    cache: &'a MailCache,
    settings: SyncSettings,
}

impl<'a, C: Connector> FolderSync<'a, C> {
    pub fn new(pool: &'a ConnectionPool<C>, cache: &'a MailCache, settings: SyncSettings) -> Self {
        Self {
            pool,
            cache,
            settings,
        }
    }

    pub async fn run(
        &self,
        ctx: &JobContext,
        conn: &mut PooledConnection<C::Connection>,
        params: &SyncParams,
    ) -> AppResult<Outcome> {
        let folder = params.folder.as_str();
        let mut stats = SyncStats::default();

        let opened = conn.session()?.examine(folder).await;
        let status = match opened {
            Ok(status) => status,
            Err(e) if e.is_connection_error() => self.reconnect(ctx, conn, folder, None, &e).await?,
            Err(e) => return Err(e),
        };

        let mut marker = self.cache.folder_marker(folder)?;
        if let Some(previous) = &marker
            && previous.uidvalidity != status.uidvalidity
        {
            let hidden = self.cache.reset_folder(folder)?;
            warn!(
                folder,
                old = previous.uidvalidity,
                new = status.uidvalidity,
                "UIDVALIDITY changed"
            );
            ctx.event(
                EventLevel::Warn,
                &format!("UIDVALIDITY of {folder} changed; resyncing from scratch"),
                json!({
                    "old_uidvalidity": previous.uidvalidity,
                    "new_uidvalidity": status.uidvalidity,
                    "hidden": hidden,
                }),
            )?;
            stats.uidvalidity_reset = true;
            marker = None;
        }

        if ctx.cancel_requested()? {
            return Ok(Outcome::Cancelled);
        }
        if params.mode == SyncMode::Incremental
            && let Some(previous) = &marker
            && marker_unchanged(previous, &status)
        {
            debug!(folder, "folder unchanged since last sync");
            stats.unchanged = true;
            ctx.progress(0, Some(0))?;
            return Ok(completed(folder, &stats, self.cache.count_live(folder)?));
        }

        let plan = self.plan(ctx, conn, folder, &status, marker.as_ref(), params.mode).await?;
        let total = plan.fetch.len() + plan.delete.len();
        ctx.progress(0, Some(total as u64))?;
        ctx.event(
            EventLevel::Info,
            &format!(
                "Planned {} fetch(es) and {} removal(s) in {folder}",
                plan.fetch.len(),
                plan.delete.len()
            ),
            json!({ "fetch": plan.fetch.len(), "delete": plan.delete.len(), "mode": params.mode }),
        )?;

        for chunk in plan.fetch.chunks(self.settings.batch_size) {
            if ctx.cancel_requested()? {
                return Ok(Outcome::Cancelled);
            }
            let messages = self.fetch_batch(ctx, conn, folder, status.uidvalidity, chunk).await?;
            stats.bodies_fetched += messages.iter().filter(|m| m.body_preview.is_some()).count();
            stats.upserted += self.cache.upsert_batch(&messages)?;
            // Expunged between planning and fetch
            let returned: HashSet<u32> = messages.iter().map(|m| m.uid).collect();
            let vanished: Vec<u32> =
                chunk.iter().copied().filter(|uid| !returned.contains(uid)).collect();
            if !vanished.is_empty() {
                stats.deleted += self.cache.mark_deleted(folder, &vanished)?;
            }
            stats.batches += 1;
            ctx.progress((messages.len() + vanished.len()) as u64, None)?;
            debug!(folder, batch = stats.batches, size = chunk.len(), "committed fetch batch");
        }

        for chunk in plan.delete.chunks(self.settings.batch_size) {
            if ctx.cancel_requested()? {
                return Ok(Outcome::Cancelled);
            }
            stats.deleted += self.cache.mark_deleted(folder, chunk)?;
            stats.batches += 1;
            ctx.progress(chunk.len() as u64, None)?;
        }

        self.cache.save_marker(&FolderMarker {
            folder: folder.to_owned(),
            uidvalidity: status.uidvalidity,
            uid_next: status.uid_next,
            exists: status.exists,
            highest_modseq: status.highest_modseq,
            synced_at: Utc::now(),
        })?;
        info!(folder, upserted = stats.upserted, deleted = stats.deleted, "folder synced");
        Ok(completed(folder, &stats, self.cache.count_live(folder)?))
    }

    async fn plan(
        &self,
        ctx: &JobContext,
        conn: &mut PooledConnection<C::Connection>,
        folder: &str,
        status: &FolderStatus,
        marker: Option<&FolderMarker>,
        mode: SyncMode,
    ) -> AppResult<SyncPlan> {
        let local = self.cache.live_uids(folder)?;
        let since = marker.and_then(|m| m.highest_modseq);
        let condstore = conn.session()?.supports_condstore() && status.highest_modseq.is_some();

        if let (Some(modseq), true, SyncMode::Incremental) = (since, condstore, mode) {
            let changed = self.changed_since(ctx, conn, folder, status, modseq).await?;
            let local_set: HashSet<u32> = local.iter().copied().collect();
            let added = changed.iter().filter(|uid| !local_set.contains(uid)).count();
            let expected = local.len() + added;
            let mut plan = SyncPlan {
                fetch: changed,
                delete: Vec::new(),
            };
            // Only a count mismatch means something vanished
            if status.exists as usize != expected {
                let remote = self.list_uids(ctx, conn, folder, status).await?;
                plan.delete = plan_from_listing(&remote, &local, false).delete;
            }
            return Ok(plan);
        }

        let remote = self.list_uids(ctx, conn, folder, status).await?;
        Ok(plan_from_listing(&remote, &local, mode == SyncMode::Full))
    }

    async fn list_uids(
        &self,
        ctx: &JobContext,
        conn: &mut PooledConnection<C::Connection>,
        folder: &str,
        status: &FolderStatus,
    ) -> AppResult<Vec<u32>> {
        let first = conn.session()?.list_uids().await;
        match first {
            Err(e) if e.is_connection_error() => {
                self.reconnect(ctx, conn, folder, Some(status.uidvalidity), &e).await?;
                conn.session()?.list_uids().await
            }
            other => other,
        }
    }

    async fn changed_since(
        &self,
        ctx: &JobContext,
        conn: &mut PooledConnection<C::Connection>,
        folder: &str,
        status: &FolderStatus,
        modseq: u64,
    ) -> AppResult<Vec<u32>> {
        let first = conn.session()?.changed_since(modseq).await;
        match first {
            Err(e) if e.is_connection_error() => {
                self.reconnect(ctx, conn, folder, Some(status.uidvalidity), &e).await?;
                conn.session()?.changed_since(modseq).await
            }
            other => other,
        }
    }

    async fn fetch_batch(
        &self,
        ctx: &JobContext,
        conn: &mut PooledConnection<C::Connection>,
        folder: &str,
        uidvalidity: u32,
        uids: &[u32],
    ) -> AppResult<Vec<CachedMessage>> {
        let mut attempt = 0;
        loop {
            let result = self.fetch_batch_once(conn.session()?, folder, uidvalidity, uids).await;
            match result {
                Ok(messages) => return Ok(messages),
                Err(e) if e.is_connection_error() && attempt == 0 => {
                    attempt += 1;
                    self.reconnect(ctx, conn, folder, Some(uidvalidity), &e).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_batch_once(
        &self,
        session: &mut C::Connection,
        folder: &str,
        uidvalidity: u32,
        uids: &[u32],
    ) -> AppResult<Vec<CachedMessage>> {
        let headers: Vec<RemoteMessage> = session.fetch_headers(uids).await?;

        let wanted: Vec<u32> = headers
            .iter()
            .filter(|m| m.size.is_none_or(|size| size <= self.settings.max_body_bytes))
            .map(|m| m.uid)
            .collect();
        let mut previews = std::collections::HashMap::new();
        for sub in wanted.chunks(self.settings.body_batch_size) {
            for (uid, raw) in session.fetch_bodies(sub).await? {
                match mime::body_preview(&raw) {
                    Ok(Some(preview)) => {
                        previews.insert(uid, preview);
                    }
                    Ok(None) => {}
                    Err(e) => debug!(folder, uid, error = %e, "skipping unparsable body"),
                }
            }
        }

        let now = Utc::now();
        let mut out = Vec::with_capacity(headers.len());
        for remote in headers {
            let envelope = mime::parse_envelope(&remote.header).unwrap_or_default();
            out.push(CachedMessage {
                folder: folder.to_owned(),
                uid: remote.uid,
                uidvalidity,
                message_id: envelope.message_id,
                subject: envelope.subject,
                from_addr: envelope.from,
                to_addr: envelope.to,
                date: envelope.date,
                flags: remote.flags,
                size_bytes: remote.size,
                body_preview: previews.remove(&remote.uid),
                deleted: false,
                updated_at: now,
            });
        }
        Ok(out)
    }

    /// Replace a failed session and reopen the folder
    ///
    /// A UIDVALIDITY change in between makes the collected UIDs meaningless,
    /// so the job fails with `Conflict` instead of continuing.
    async fn reconnect(
        &self,
        ctx: &JobContext,
        conn: &mut PooledConnection<C::Connection>,
        folder: &str,
        expected_uidvalidity: Option<u32>,
        cause: &AppError,
    ) -> AppResult<FolderStatus> {
        let status = renew_and_open(self.pool, ctx, conn, folder, false, cause).await?;
        if let Some(expected) = expected_uidvalidity
            && expected != status.uidvalidity
        {
            return Err(AppError::Conflict(format!(
                "UIDVALIDITY of {folder} changed during sync"
            )));
        }
        Ok(status)
    }
}

fn completed(folder: &str, stats: &SyncStats, cached: u64) -> Outcome {
    let summary = if stats.unchanged {
        format!("{folder} unchanged")
    } else {
        format!(
            "Synced {folder}: {} upserted, {} removed in {} batch(es)",
            stats.upserted, stats.deleted, stats.batches
        )
    };
    Outcome::Completed {
        summary,
        data: json!({ "folder": folder, "stats": stats, "cached": cached }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::{FolderSync, SyncMode, SyncParams, SyncSettings, plan_from_listing};
    use crate::cache::MailCache;
    use crate::executor::{JobContext, Outcome};
    use crate::jobs::{JobStore, JobType};
    use crate::pool::ConnectionPool;
    use crate::testing::{FakeConnector, FakeServer};

    const SETTINGS: SyncSettings = SyncSettings {
        batch_size: 50,
        body_batch_size: 10,
        max_body_bytes: 262_144,
    };

    struct Fixture {
        server: Arc<FakeServer>,
        store: Arc<JobStore>,
        cache: MailCache,
        pool: ConnectionPool<FakeConnector>,
    }

    impl Fixture {
        fn new() -> Self {
            let server = FakeServer::new();
            let pool = ConnectionPool::new(Arc::new(server.connector()), 1, Duration::from_secs(5));
            Self {
                server,
                store: Arc::new(JobStore::in_memory().expect("store")),
                cache: MailCache::in_memory().expect("cache"),
                pool,
            }
        }

        fn running_job(&self) -> JobContext {
            let job_id = self
                .store
                .enqueue(JobType::Sync, json!({ "folder": "INBOX" }))
                .expect("enqueue");
            self.store.claim_next("w1").expect("claim").expect("job");
            JobContext::new(Arc::clone(&self.store), &job_id)
        }

        async fn sync(&self, mode: SyncMode) -> Outcome {
            let ctx = self.running_job();
            let mut conn = self.pool.acquire().await.expect("acquire");
            let params = SyncParams {
                folder: "INBOX".to_owned(),
                mode,
                trigger: None,
            };
            let outcome = FolderSync::new(&self.pool, &self.cache, SETTINGS)
                .run(&ctx, &mut conn, &params)
                .await
                .expect("sync");
            self.pool.release(conn);
            outcome
        }
    }

    fn stats(outcome: &Outcome) -> serde_json::Value {
        match outcome {
            Outcome::Completed { data, .. } => data["stats"].clone(),
            Outcome::Cancelled => panic!("unexpected cancel"),
        }
    }

    #[test]
    fn listing_plan_diffs_both_directions() {
        let plan = plan_from_listing(&[1, 2, 4], &[2, 3], false);
        assert_eq!(plan.fetch, vec![1, 4]);
        assert_eq!(plan.delete, vec![3]);

        let full = plan_from_listing(&[1, 2, 4], &[2, 3], true);
        assert_eq!(full.fetch, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn initial_sync_populates_cache_and_marker() {
        let fx = Fixture::new();
        fx.server.append_many("INBOX", 120);

        let outcome = fx.sync(SyncMode::Full).await;
        assert_eq!(stats(&outcome)["upserted"], 120);
        assert_eq!(stats(&outcome)["batches"], 3);
        assert_eq!(fx.cache.count_live("INBOX").expect("count"), 120);

        let cached = fx.cache.get_message("INBOX", 1).expect("get").expect("row");
        assert_eq!(cached.subject.as_deref(), Some("m0"));
        assert_eq!(cached.body_preview.as_deref(), Some("Body of m0"));
        let marker = fx.cache.folder_marker("INBOX").expect("marker").expect("saved");
        assert_eq!(marker.exists, 120);
    }

    #[tokio::test]
    async fn second_incremental_run_does_no_work() {
        let fx = Fixture::new();
        fx.server.append_many("INBOX", 30);
        fx.sync(SyncMode::Full).await;
        let before = fx.server.stats();

        let outcome = fx.sync(SyncMode::Incremental).await;
        assert_eq!(stats(&outcome)["unchanged"], true);
        let after = fx.server.stats();
        assert_eq!(after.header_fetches, before.header_fetches);
        assert_eq!(after.listings, before.listings);
        assert_eq!(fx.cache.count_live("INBOX").expect("count"), 30);
    }

    #[tokio::test]
    async fn incremental_without_condstore_applies_additions_and_removals() {
        let fx = Fixture::new();
        fx.server.set_capabilities(true, false, true);
        let uids = fx.server.append_many("INBOX", 5);
        fx.sync(SyncMode::Full).await;

        fx.server.expunge("INBOX", uids[0]);
        fx.server.append("INBOX", "late");
        let outcome = fx.sync(SyncMode::Incremental).await;
        assert_eq!(stats(&outcome)["upserted"], 1);
        assert_eq!(stats(&outcome)["deleted"], 1);
        assert_eq!(fx.cache.live_uids("INBOX").expect("uids"), vec![2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn incremental_with_condstore_refreshes_changed_flags() {
        let fx = Fixture::new();
        let uids = fx.server.append_many("INBOX", 5);
        fx.sync(SyncMode::Full).await;
        let listings = fx.server.stats().listings;

        fx.server.set_flag("INBOX", uids[2], "\\Flagged");
        let outcome = fx.sync(SyncMode::Incremental).await;
        assert_eq!(stats(&outcome)["upserted"], 1);
        assert_eq!(fx.server.stats().listings, listings);
        let row = fx.cache.get_message("INBOX", uids[2]).expect("get").expect("row");
        assert_eq!(row.flags, vec!["\\Flagged".to_owned()]);
    }

    #[tokio::test]
    async fn uidvalidity_change_resets_folder() {
        let fx = Fixture::new();
        fx.server.append_many("INBOX", 3);
        fx.sync(SyncMode::Full).await;

        fx.server.reset_uidvalidity("INBOX", 2);
        let outcome = fx.sync(SyncMode::Incremental).await;
        assert_eq!(stats(&outcome)["uidvalidity_reset"], true);
        assert_eq!(fx.cache.live_uids("INBOX").expect("uids"), vec![4, 5, 6]);
        let marker = fx.cache.folder_marker("INBOX").expect("marker").expect("saved");
        assert_eq!(marker.uidvalidity, 2);
    }

    #[tokio::test]
    async fn message_expunged_before_fetch_is_removed_and_counted() {
        let fx = Fixture::new();
        let uids = fx.server.append_many("INBOX", 5);
        fx.sync(SyncMode::Full).await;

        fx.server.expunge_before_next_fetch("INBOX", uids[2]);
        let ctx = fx.running_job();
        let mut conn = fx.pool.acquire().await.expect("acquire");
        let params = SyncParams {
            folder: "INBOX".to_owned(),
            mode: SyncMode::Full,
            trigger: None,
        };
        let outcome = FolderSync::new(&fx.pool, &fx.cache, SETTINGS)
            .run(&ctx, &mut conn, &params)
            .await
            .expect("sync");
        fx.pool.release(conn);

        assert_eq!(stats(&outcome)["upserted"], 4);
        assert_eq!(stats(&outcome)["deleted"], 1);
        assert_eq!(fx.cache.live_uids("INBOX").expect("uids"), vec![1, 2, 4, 5]);
        let job = fx.store.get_job(ctx.job_id()).expect("get").expect("job");
        assert_eq!(job.processed, 5);
        assert_eq!(job.total_estimate, Some(5));
    }

    #[tokio::test]
    async fn cancel_before_first_batch_leaves_marker_unsaved() {
        let fx = Fixture::new();
        fx.server.append_many("INBOX", 10);
        let ctx = fx.running_job();
        fx.store.request_cancel(ctx.job_id()).expect("cancel");

        let mut conn = fx.pool.acquire().await.expect("acquire");
        let params = SyncParams {
            folder: "INBOX".to_owned(),
            mode: SyncMode::Full,
            trigger: None,
        };
        let outcome = FolderSync::new(&fx.pool, &fx.cache, SETTINGS)
            .run(&ctx, &mut conn, &params)
            .await
            .expect("sync");
        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(fx.server.stats().header_fetches, 0);
        assert!(fx.cache.folder_marker("INBOX").expect("marker").is_none());
    }
}
