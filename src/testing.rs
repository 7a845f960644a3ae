//! In-process mailbox implementing the connection traits for tests
//!
//! Supports failure injection (connect refusal, persistent or one-shot
//! header-fetch failures, dropped IDLE sessions) and records concurrency
//! gauges.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::errors::{AppError, AppResult};
use crate::protocol::{ChangeKind, Connector, FolderStatus, MailConnection, RemoteMessage};

#[derive(Debug, Clone)]
struct FakeMessage {
    flags: Vec<String>,
    modseq: u64,
    raw: Vec<u8>,
}

#[derive(Debug)]
struct FakeFolder {
    uidvalidity: u32,
    uid_next: u32,
    modseq: u64,
    messages: BTreeMap<u32, FakeMessage>,
}

impl FakeFolder {
    fn new(uidvalidity: u32) -> Self {
        Self {
            uidvalidity,
            uid_next: 1,
            modseq: 1,
            messages: BTreeMap::new(),
        }
    }

    fn insert(&mut self, raw: Vec<u8>, flags: Vec<String>) -> u32 {
        let uid = self.uid_next;
        self.uid_next += 1;
        self.modseq += 1;
        self.messages.insert(
            uid,
            FakeMessage {
                flags,
                modseq: self.modseq,
                raw,
            },
        );
        uid
    }

    fn status(&self, condstore: bool) -> FolderStatus {
        FolderStatus {
            uidvalidity: self.uidvalidity,
            exists: u32::try_from(self.messages.len()).unwrap_or(u32::MAX),
            uid_next: Some(self.uid_next),
            highest_modseq: condstore.then_some(self.modseq),
        }
    }
}

/// Counters observed by tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeStats {
    pub connects: usize,
    pub header_fetches: usize,
    pub body_fetches: usize,
    pub listings: usize,
    pub max_in_flight: usize,
    pub stores: usize,
    pub moves: usize,
}

/// Shared mailbox state behind every fake connection
pub struct FakeServer {
    folders: Mutex<HashMap<String, FakeFolder>>,
    supports_idle: AtomicBool,
    supports_condstore: AtomicBool,
    supports_move: AtomicBool,
    refuse_connects: AtomicBool,
    next_connection: AtomicU64,
    connects: AtomicUsize,
    header_fetches: AtomicUsize,
    body_fetches: AtomicUsize,
    listings: AtomicUsize,
    stores: AtomicUsize,
    moves: AtomicUsize,
    fail_headers_from: Mutex<Option<usize>>,
    header_failures: AtomicUsize,
    renumber_on_failure: Mutex<Option<(String, u32)>>,
    expunge_on_fetch: Mutex<Vec<(String, u32)>>,
    fetch_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fetched_by: Mutex<Vec<(String, u64)>>,
    idle_queue: Mutex<VecDeque<Vec<ChangeKind>>>,
    idle_failures: AtomicUsize,
    idle_wake: Notify,
}

impl FakeServer {
    /// A server with an empty `INBOX` that supports IDLE and CONDSTORE
    pub fn new() -> Arc<Self> {
        let mut folders = HashMap::new();
        folders.insert("INBOX".to_owned(), FakeFolder::new(1));
        Arc::new(Self {
            folders: Mutex::new(folders),
            supports_idle: AtomicBool::new(true),
            supports_condstore: AtomicBool::new(true),
            supports_move: AtomicBool::new(true),
            refuse_connects: AtomicBool::new(false),
            next_connection: AtomicU64::new(1),
            connects: AtomicUsize::new(0),
            header_fetches: AtomicUsize::new(0),
            body_fetches: AtomicUsize::new(0),
            listings: AtomicUsize::new(0),
            stores: AtomicUsize::new(0),
            moves: AtomicUsize::new(0),
            fail_headers_from: Mutex::new(None),
            header_failures: AtomicUsize::new(0),
            renumber_on_failure: Mutex::new(None),
            expunge_on_fetch: Mutex::new(Vec::new()),
            fetch_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fetched_by: Mutex::new(Vec::new()),
            idle_queue: Mutex::new(VecDeque::new()),
            idle_failures: AtomicUsize::new(0),
            idle_wake: Notify::new(),
        })
    }

    pub fn connector(self: &Arc<Self>) -> FakeConnector {
        FakeConnector {
            server: Arc::clone(self),
        }
    }

    fn folders(&self) -> MutexGuard<'_, HashMap<String, FakeFolder>> {
        self.folders.lock().expect("fake folders lock")
    }

    pub fn add_folder(&self, name: &str, uidvalidity: u32) {
        self.folders()
            .insert(name.to_owned(), FakeFolder::new(uidvalidity));
    }

    /// Append a small text message and return its UID
    pub fn append(&self, folder: &str, subject: &str) -> u32 {
        let mut folders = self.folders();
        let target = folders.get_mut(folder).expect("folder exists");
        let uid = target.uid_next;
        let raw = format!(
            "Message-ID: <{uid}.{subject}@fake.test>\r\n\
             Subject: {subject}\r\n\
             From: Alice <alice@fake.test>\r\n\
             To: bob@fake.test\r\n\
             Date: Mon, 5 Oct 2026 10:00:00 +0000\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             \r\n\
             Body of {subject}\r\n"
        );
        target.insert(raw.into_bytes(), Vec::new())
    }

    pub fn append_many(&self, folder: &str, count: usize) -> Vec<u32> {
        (0..count).map(|i| self.append(folder, &format!("m{i}"))).collect()
    }

    pub fn expunge(&self, folder: &str, uid: u32) {
        let mut folders = self.folders();
        let target = folders.get_mut(folder).expect("folder exists");
        target.messages.remove(&uid);
        target.modseq += 1;
    }

    pub fn set_flag(&self, folder: &str, uid: u32, flag: &str) {
        let mut folders = self.folders();
        let target = folders.get_mut(folder).expect("folder exists");
        target.modseq += 1;
        let modseq = target.modseq;
        if let Some(msg) = target.messages.get_mut(&uid) {
            msg.flags.push(flag.to_owned());
            msg.modseq = modseq;
        }
    }

    pub fn flags(&self, folder: &str, uid: u32) -> Option<Vec<String>> {
        self.folders()
            .get(folder)
            .and_then(|f| f.messages.get(&uid))
            .map(|m| m.flags.clone())
    }

    pub fn uids(&self, folder: &str) -> Vec<u32> {
        self.folders()
            .get(folder)
            .map(|f| f.messages.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Renumber a folder as if the server rebuilt it
    pub fn reset_uidvalidity(&self, folder: &str, uidvalidity: u32) {
        let mut folders = self.folders();
        let target = folders.get_mut(folder).expect("folder exists");
        let old: Vec<FakeMessage> = std::mem::take(&mut target.messages).into_values().collect();
        target.uidvalidity = uidvalidity;
        for msg in old {
            target.insert(msg.raw, msg.flags);
        }
    }

    pub fn set_capabilities(&self, idle: bool, condstore: bool, mv: bool) {
        self.supports_idle.store(idle, Ordering::SeqCst);
        self.supports_condstore.store(condstore, Ordering::SeqCst);
        self.supports_move.store(mv, Ordering::SeqCst);
    }

    pub fn fail_connects(&self, refuse: bool) {
        self.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    /// Fail the `n`-th header fetch (1-based) and every later one
    pub fn fail_header_fetches_from(&self, n: usize) {
        *self.fail_headers_from.lock().expect("lock") = Some(n);
    }

    /// Fail only the next `n` header fetches; later ones succeed again
    pub fn fail_next_header_fetches(&self, n: usize) {
        self.header_failures.store(n, Ordering::SeqCst);
    }

    /// Renumber `folder` when the next injected header-fetch failure fires,
    /// so the reconnect sees a different UIDVALIDITY
    pub fn renumber_on_next_failure(&self, folder: &str, uidvalidity: u32) {
        let target = Some((folder.to_owned(), uidvalidity));
        *self.renumber_on_failure.lock().expect("lock") = target;
    }

    /// Expunge `uid` right before the next header fetch runs
    pub fn expunge_before_next_fetch(&self, folder: &str, uid: u32) {
        self.expunge_on_fetch.lock().expect("lock").push((folder.to_owned(), uid));
    }

    fn take_header_failure(&self, call: usize) -> bool {
        let one_shot = self
            .header_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let fail_from = *self.fail_headers_from.lock().expect("lock");
        let failed = one_shot || fail_from.is_some_and(|n| call >= n);
        if failed {
            let renumber = self.renumber_on_failure.lock().expect("lock").take();
            if let Some((folder, uidvalidity)) = renumber {
                self.reset_uidvalidity(&folder, uidvalidity);
            }
        }
        failed
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().expect("lock") = delay;
    }

    /// Deliver an untagged change to one session waiting in IDLE
    pub fn push_idle(&self, kinds: Vec<ChangeKind>) {
        self.idle_queue.lock().expect("lock").push_back(kinds);
        self.idle_wake.notify_one();
    }

    /// Make the next `n` IDLE waits fail as if the socket dropped
    pub fn drop_idle_sessions(&self, n: usize) {
        self.idle_failures.store(n, Ordering::SeqCst);
        self.idle_wake.notify_one();
    }

    /// (folder, connection id) for every header fetch, in order
    pub fn fetched_by(&self) -> Vec<(String, u64)> {
        self.fetched_by.lock().expect("lock").clone()
    }

    pub fn stats(&self) -> FakeStats {
        FakeStats {
            connects: self.connects.load(Ordering::SeqCst),
            header_fetches: self.header_fetches.load(Ordering::SeqCst),
            body_fetches: self.body_fetches.load(Ordering::SeqCst),
            listings: self.listings.load(Ordering::SeqCst),
            max_in_flight: self.max_in_flight.load(Ordering::SeqCst),
            stores: self.stores.load(Ordering::SeqCst),
            moves: self.moves.load(Ordering::SeqCst),
        }
    }
}

pub struct FakeConnector {
    server: Arc<FakeServer>,
}

impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self) -> AppResult<FakeConnection> {
        if self.server.refuse_connects.load(Ordering::SeqCst) {
            return Err(AppError::Protocol("connection refused".to_owned()));
        }
        self.server.connects.fetch_add(1, Ordering::SeqCst);
        Ok(FakeConnection {
            id: self.server.next_connection.fetch_add(1, Ordering::SeqCst),
            server: Arc::clone(&self.server),
            selected: None,
        })
    }
}

pub struct FakeConnection {
    id: u64,
    server: Arc<FakeServer>,
    selected: Option<String>,
}

impl FakeConnection {
    fn selected(&self) -> AppResult<String> {
        self.selected
            .clone()
            .ok_or_else(|| AppError::Protocol("no folder selected".to_owned()))
    }

    fn open(&mut self, folder: &str) -> AppResult<FolderStatus> {
        let condstore = self.supports_condstore();
        let folders = self.server.folders();
        let status = folders
            .get(folder)
            .map(|f| f.status(condstore))
            .ok_or_else(|| AppError::NotFound(format!("mailbox '{folder}'")))?;
        drop(folders);
        self.selected = Some(folder.to_owned());
        Ok(status)
    }
}

impl MailConnection for FakeConnection {
    fn connection_id(&self) -> u64 {
        self.id
    }

    fn supports_idle(&self) -> bool {
        self.server.supports_idle.load(Ordering::SeqCst)
    }

    fn supports_condstore(&self) -> bool {
        self.server.supports_condstore.load(Ordering::SeqCst)
    }

    async fn examine(&mut self, folder: &str) -> AppResult<FolderStatus> {
        self.open(folder)
    }

    async fn select(&mut self, folder: &str) -> AppResult<FolderStatus> {
        self.open(folder)
    }

    async fn list_uids(&mut self) -> AppResult<Vec<u32>> {
        let folder = self.selected()?;
        self.server.listings.fetch_add(1, Ordering::SeqCst);
        Ok(self.server.uids(&folder))
    }

    async fn changed_since(&mut self, modseq: u64) -> AppResult<Vec<u32>> {
        let folder = self.selected()?;
        let folders = self.server.folders();
        Ok(folders
            .get(&folder)
            .map(|f| {
                f.messages
                    .iter()
                    .filter(|(_, m)| m.modseq > modseq)
                    .map(|(uid, _)| *uid)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_headers(&mut self, uids: &[u32]) -> AppResult<Vec<RemoteMessage>> {
        let folder = self.selected()?;
        let call = self.server.header_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let pending = std::mem::take(&mut *self.server.expunge_on_fetch.lock().expect("lock"));
        for (name, uid) in pending {
            self.server.expunge(&name, uid);
        }
        if self.server.take_header_failure(call) {
            return Err(AppError::Protocol("connection reset by peer".to_owned()));
        }
        self.server
            .fetched_by
            .lock()
            .expect("lock")
            .push((folder.clone(), self.id));

        let now = self.server.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.server.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.server.fetch_delay.lock().expect("lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.server.in_flight.fetch_sub(1, Ordering::SeqCst);

        let wanted: HashSet<u32> = uids.iter().copied().collect();
        let folders = self.server.folders();
        let Some(f) = folders.get(&folder) else {
            return Ok(Vec::new());
        };
        Ok(f.messages
            .iter()
            .filter(|(uid, _)| wanted.contains(uid))
            .map(|(uid, m)| {
                let header_end = m
                    .raw
                    .windows(4)
                    .position(|w| w == b"\r\n\r\n")
                    .map_or(m.raw.len(), |p| p + 4);
                RemoteMessage {
                    uid: *uid,
                    flags: m.flags.clone(),
                    size: u32::try_from(m.raw.len()).ok(),
                    header: m.raw[..header_end].to_vec(),
                }
            })
            .collect())
    }

    async fn fetch_bodies(&mut self, uids: &[u32]) -> AppResult<Vec<(u32, Vec<u8>)>> {
        let folder = self.selected()?;
        self.server.body_fetches.fetch_add(1, Ordering::SeqCst);
        let folders = self.server.folders();
        Ok(uids
            .iter()
            .filter_map(|uid| {
                folders
                    .get(&folder)
                    .and_then(|f| f.messages.get(uid))
                    .map(|m| (*uid, m.raw.clone()))
            })
            .collect())
    }

    async fn add_flags(&mut self, uids: &[u32], flags: &str) -> AppResult<()> {
        let folder = self.selected()?;
        self.server.stores.fetch_add(1, Ordering::SeqCst);
        let names: Vec<String> = flags
            .trim_matches(|c| c == '(' || c == ')')
            .split_whitespace()
            .map(str::to_owned)
            .collect();
        let mut folders = self.server.folders();
        let Some(target) = folders.get_mut(&folder) else {
            return Ok(());
        };
        for uid in uids {
            target.modseq += 1;
            let modseq = target.modseq;
            if let Some(msg) = target.messages.get_mut(uid) {
                for name in &names {
                    if !msg.flags.contains(name) {
                        msg.flags.push(name.clone());
                    }
                }
                msg.modseq = modseq;
            }
        }
        Ok(())
    }

    async fn move_messages(&mut self, uids: &[u32], destination: &str) -> AppResult<()> {
        let folder = self.selected()?;
        self.server.moves.fetch_add(1, Ordering::SeqCst);
        let mut folders = self.server.folders();
        if !folders.contains_key(destination) {
            return Err(AppError::NotFound(format!("mailbox '{destination}'")));
        }
        let moved: Vec<FakeMessage> = match folders.get_mut(&folder) {
            Some(source) => {
                let taken: Vec<FakeMessage> =
                    uids.iter().filter_map(|uid| source.messages.remove(uid)).collect();
                source.modseq += 1;
                taken
            }
            None => Vec::new(),
        };
        if let Some(target) = folders.get_mut(destination) {
            for msg in moved {
                target.insert(msg.raw, msg.flags);
            }
        }
        Ok(())
    }

    async fn idle(&mut self, timeout: Duration) -> AppResult<Vec<ChangeKind>> {
        self.selected()?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let failures = self.server.idle_failures.load(Ordering::SeqCst);
            if failures > 0 {
                self.server.idle_failures.store(failures - 1, Ordering::SeqCst);
                return Err(AppError::Protocol("IDLE connection dropped".to_owned()));
            }
            if let Some(kinds) = self.server.idle_queue.lock().expect("lock").pop_front() {
                return Ok(kinds);
            }
            tokio::select! {
                _ = self.server.idle_wake.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }
}
