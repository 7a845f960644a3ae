//! Connection traits used by the pool, sync tasks and watch monitors
//!
//! `ImapConnector` in `imap.rs` is the production implementation; tests plug
//! in an in-process mailbox.

use std::future::Future;
use std::time::Duration;

use crate::errors::AppResult;

/// Mailbox state reported by EXAMINE/SELECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderStatus {
    pub uidvalidity: u32,
    pub exists: u32,
    pub uid_next: Option<u32>,
    pub highest_modseq: Option<u64>,
}

/// Envelope data fetched for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    pub size: Option<u32>,
    /// Raw header block (selected fields only)
    pub header: Vec<u8>,
}

/// Kind of change announced by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    MessageAdded,
    MessageRemoved,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageAdded => "message_added",
            Self::MessageRemoved => "message_removed",
        }
    }
}

/// One authenticated session
///
/// Every method may fail with `Protocol` or `Timeout`, after which the
/// session must be discarded.
pub trait MailConnection: Send + 'static {
    /// Identifier for logs and tests
    fn connection_id(&self) -> u64;

    fn supports_idle(&self) -> bool;

    fn supports_condstore(&self) -> bool;

    /// Open `folder` read-only
    fn examine(&mut self, folder: &str) -> impl Future<Output = AppResult<FolderStatus>> + Send;

    /// Open `folder` read-write
    fn select(&mut self, folder: &str) -> impl Future<Output = AppResult<FolderStatus>> + Send;

    /// All UIDs in the selected folder, ascending
    fn list_uids(&mut self) -> impl Future<Output = AppResult<Vec<u32>>> + Send;

    /// UIDs whose mod-sequence is greater than `modseq`, ascending
    fn changed_since(&mut self, modseq: u64) -> impl Future<Output = AppResult<Vec<u32>>> + Send;

    /// Flags, size and headers for `uids`; vanished UIDs are simply absent
    fn fetch_headers(
        &mut self,
        uids: &[u32],
    ) -> impl Future<Output = AppResult<Vec<RemoteMessage>>> + Send;

    /// Full raw message bodies for `uids`
    fn fetch_bodies(
        &mut self,
        uids: &[u32],
    ) -> impl Future<Output = AppResult<Vec<(u32, Vec<u8>)>>> + Send;

    /// Add `flags` (IMAP list syntax, e.g. `(\Seen)`) silently
    fn add_flags(&mut self, uids: &[u32], flags: &str)
    -> impl Future<Output = AppResult<()>> + Send;

    /// Move messages to `destination`, falling back to COPY + EXPUNGE
    fn move_messages(
        &mut self,
        uids: &[u32],
        destination: &str,
    ) -> impl Future<Output = AppResult<()>> + Send;

    /// Wait in IDLE until the server reports changes or `timeout` elapses
    ///
    /// Returns the kinds seen; an empty list means the timeout expired.
    fn idle(&mut self, timeout: Duration)
    -> impl Future<Output = AppResult<Vec<ChangeKind>>> + Send;
}

/// Factory for new authenticated sessions
pub trait Connector: Send + Sync + 'static {
    type Connection: MailConnection;

    fn connect(&self) -> impl Future<Output = AppResult<Self::Connection>> + Send;
}
