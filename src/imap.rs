//! IMAP transport and session operations
//!
//! Provides timeout-bounded wrappers around `async-imap` operations and the
//! production `Connector`. All network calls are enforced to use TLS, and
//! timeouts are derived from the engine config. Failures of an established
//! session map to `Protocol`/`Timeout` so callers know to discard it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{MailboxDatum, Response};
use async_imap::types::{Fetch, Flag, Mailbox};
use async_imap::{Client, Session};
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{AccountConfig, ImapTimeouts};
use crate::errors::{AppError, AppResult};
use crate::protocol::{ChangeKind, Connector, FolderStatus, MailConnection, RemoteMessage};

/// Type alias for authenticated IMAP session over TLS
///
/// Wraps the TLS stream type to simplify signatures throughout the codebase.
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

const HEADER_QUERY: &str =
    "(UID FLAGS RFC822.SIZE BODY.PEEK[HEADER.FIELDS (MESSAGE-ID DATE FROM TO SUBJECT)])";
const BODY_QUERY: &str = "(UID BODY.PEEK[])";

/// Connect to IMAP server and authenticate
///
/// Performs full connection sequence with timeouts:
/// 1. TCP connect
/// 2. TLS handshake with system root certificates
/// 3. Read IMAP greeting
/// 4. LOGIN authentication
///
/// # Security
///
/// Rejects insecure connections (`secure: false`) to prevent password exposure.
///
/// # Errors
///
/// - `InvalidInput` if `secure` is false or hostname is invalid for TLS SNI
/// - `Timeout` if any connection phase times out
/// - `AuthFailed` if authentication fails
/// - `Protocol` for TCP, TLS, or greeting failures
pub async fn connect_authenticated(
    timeouts: &ImapTimeouts,
    account: &AccountConfig,
) -> AppResult<ImapSession> {
    if !account.secure {
        return Err(AppError::InvalidInput(
            "insecure IMAP is not supported; set MAIL_IMAP_SECURE=true".to_owned(),
        ));
    }

    let connect_duration = Duration::from_millis(timeouts.connect_timeout_ms);
    let greeting_duration = Duration::from_millis(timeouts.greeting_timeout_ms);

    let tcp = timeout(
        connect_duration,
        TcpStream::connect((account.host.as_str(), account.port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Protocol(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(account.host.clone())
        .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(greeting_duration, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(greeting_duration, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(AppError::Protocol(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    let pass = account.pass.expose_secret();
    let session = timeout(greeting_duration, client.login(account.user.as_str(), pass))
        .await
        .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|(e, _)| {
                let msg = e.to_string();
                if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                    AppError::AuthFailed(msg)
                } else {
                    AppError::Protocol(msg)
                }
            })
        })?;

    Ok(session)
}

/// Run one session command under the socket timeout
async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> AppResult<T>
where
    F: Future<Output = async_imap::error::Result<T>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| AppError::Timeout(format!("{what} timed out")))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("{what} failed: {e}"))))
}

/// Compress UIDs into an IMAP sequence set (`1:3,7,9:10`)
pub fn uid_set(uids: &[u32]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts: Vec<String> = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;
    for uid in iter {
        if end.checked_add(1) == Some(uid) {
            end = uid;
            continue;
        }
        parts.push(range_part(start, end));
        start = uid;
        end = uid;
    }
    parts.push(range_part(start, end));
    parts.join(",")
}

fn range_part(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}:{end}")
    }
}

/// Render a fetched flag the way it appears on the wire
pub fn flag_name(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_owned(),
        Flag::Answered => "\\Answered".to_owned(),
        Flag::Flagged => "\\Flagged".to_owned(),
        Flag::Deleted => "\\Deleted".to_owned(),
        Flag::Draft => "\\Draft".to_owned(),
        Flag::Recent => "\\Recent".to_owned(),
        Flag::MayCreate => "\\*".to_owned(),
        Flag::Custom(name) => name.to_string(),
    }
}

/// Classify an untagged response received during IDLE
pub fn change_from_response(response: &Response<'_>) -> Option<ChangeKind> {
    match response {
        Response::MailboxData(MailboxDatum::Exists(_)) => Some(ChangeKind::MessageAdded),
        Response::Expunge(_) | Response::Vanished { .. } => Some(ChangeKind::MessageRemoved),
        _ => None,
    }
}

fn folder_status(folder: &str, mailbox: &Mailbox) -> AppResult<FolderStatus> {
    let uidvalidity = mailbox
        .uid_validity
        .ok_or_else(|| AppError::Protocol(format!("mailbox '{folder}' missing UIDVALIDITY")))?;
    Ok(FolderStatus {
        uidvalidity,
        exists: mailbox.exists,
        uid_next: mailbox.uid_next,
        highest_modseq: mailbox.highest_modseq,
    })
}

fn sorted_uids(set: impl IntoIterator<Item = u32>) -> Vec<u32> {
    let mut uids: Vec<u32> = set.into_iter().collect();
    uids.sort_unstable();
    uids
}

/// Opens authenticated sessions for the configured account
pub struct ImapConnector {
    account: AccountConfig,
    timeouts: ImapTimeouts,
    next_id: AtomicU64,
}

impl ImapConnector {
    pub fn new(account: AccountConfig, timeouts: ImapTimeouts) -> Self {
        Self {
            account,
            timeouts,
            next_id: AtomicU64::new(1),
        }
    }
}

impl Connector for ImapConnector {
    type Connection = ImapConnection;

    async fn connect(&self) -> AppResult<ImapConnection> {
        let socket = Duration::from_millis(self.timeouts.socket_timeout_ms);
        let mut session = connect_authenticated(&self.timeouts, &self.account).await?;
        let caps = bounded(socket, "CAPABILITY", session.capabilities()).await?;
        let supports_condstore = caps.has_str("CONDSTORE") || caps.has_str("QRESYNC");
        if supports_condstore && caps.has_str("ENABLE") {
            bounded(
                socket,
                "ENABLE CONDSTORE",
                session.run_command_and_check_ok("ENABLE CONDSTORE"),
            )
            .await?;
        }
        let conn = ImapConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            session: Some(session),
            socket,
            supports_idle: caps.has_str("IDLE"),
            supports_condstore,
            supports_move: caps.has_str("MOVE"),
        };
        debug!(
            connection = conn.id,
            idle = conn.supports_idle,
            condstore = conn.supports_condstore,
            move_ext = conn.supports_move,
            "IMAP session established"
        );
        Ok(conn)
    }
}

/// One authenticated IMAP session
///
/// The session sits in an `Option` because IDLE consumes it; a failed IDLE
/// leaves the connection without a session and every later call fails.
pub struct ImapConnection {
    id: u64,
    session: Option<ImapSession>,
    socket: Duration,
    supports_idle: bool,
    supports_condstore: bool,
    supports_move: bool,
}

impl ImapConnection {
    fn session(&mut self) -> AppResult<&mut ImapSession> {
        self.session
            .as_mut()
            .ok_or_else(|| AppError::Protocol("IMAP session lost during IDLE".to_owned()))
    }

    async fn fetch(&mut self, uids: &[u32], query: &str) -> AppResult<Vec<Fetch>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let socket = self.socket;
        let set = uid_set(uids);
        let session = self.session()?;
        let stream = bounded(socket, "UID FETCH", session.uid_fetch(set, query)).await?;
        bounded(socket, "UID FETCH stream", stream.try_collect::<Vec<_>>()).await
    }

    async fn store(&mut self, uids: &[u32], query: String) -> AppResult<()> {
        let socket = self.socket;
        let set = uid_set(uids);
        let session = self.session()?;
        let stream = bounded(socket, "UID STORE", session.uid_store(set, query)).await?;
        let _: Vec<Fetch> = bounded(socket, "UID STORE stream", stream.try_collect()).await?;
        Ok(())
    }
}

impl MailConnection for ImapConnection {
    fn connection_id(&self) -> u64 {
        self.id
    }

    fn supports_idle(&self) -> bool {
        self.supports_idle
    }

    fn supports_condstore(&self) -> bool {
        self.supports_condstore
    }

    async fn examine(&mut self, folder: &str) -> AppResult<FolderStatus> {
        let socket = self.socket;
        let encoded = utf7_imap::encode_utf7_imap(folder.to_owned());
        let session = self.session()?;
        let mailbox = timeout(socket, session.examine(&encoded))
            .await
            .map_err(|_| AppError::Timeout(format!("EXAMINE timed out for mailbox '{folder}'")))
            .and_then(|r| {
                r.map_err(|e| match e {
                    async_imap::error::Error::No(_) => {
                        AppError::NotFound(format!("cannot examine mailbox '{folder}': {e}"))
                    }
                    other => AppError::Protocol(format!("EXAMINE failed: {other}")),
                })
            })?;
        folder_status(folder, &mailbox)
    }

    async fn select(&mut self, folder: &str) -> AppResult<FolderStatus> {
        let socket = self.socket;
        let encoded = utf7_imap::encode_utf7_imap(folder.to_owned());
        let session = self.session()?;
        let mailbox = timeout(socket, session.select(&encoded))
            .await
            .map_err(|_| AppError::Timeout(format!("SELECT timed out for mailbox '{folder}'")))
            .and_then(|r| {
                r.map_err(|e| match e {
                    async_imap::error::Error::No(_) => {
                        AppError::NotFound(format!("cannot select mailbox '{folder}': {e}"))
                    }
                    other => AppError::Protocol(format!("SELECT failed: {other}")),
                })
            })?;
        folder_status(folder, &mailbox)
    }

    async fn list_uids(&mut self) -> AppResult<Vec<u32>> {
        let socket = self.socket;
        let session = self.session()?;
        let set = bounded(socket, "UID SEARCH", session.uid_search("ALL")).await?;
        Ok(sorted_uids(set))
    }

    async fn changed_since(&mut self, modseq: u64) -> AppResult<Vec<u32>> {
        let socket = self.socket;
        let query = format!("MODSEQ {}", modseq.saturating_add(1));
        let session = self.session()?;
        let set = bounded(socket, "UID SEARCH MODSEQ", session.uid_search(query)).await?;
        Ok(sorted_uids(set))
    }

    async fn fetch_headers(&mut self, uids: &[u32]) -> AppResult<Vec<RemoteMessage>> {
        let fetches = self.fetch(uids, HEADER_QUERY).await?;
        Ok(fetches
            .iter()
            .filter_map(|fetch| {
                let uid = fetch.uid?;
                let header = fetch.header().or_else(|| fetch.body()).unwrap_or_default();
                Some(RemoteMessage {
                    uid,
                    flags: fetch.flags().map(|f| flag_name(&f)).collect(),
                    size: fetch.size,
                    header: header.to_vec(),
                })
            })
            .collect())
    }

    async fn fetch_bodies(&mut self, uids: &[u32]) -> AppResult<Vec<(u32, Vec<u8>)>> {
        let fetches = self.fetch(uids, BODY_QUERY).await?;
        Ok(fetches
            .iter()
            .filter_map(|fetch| Some((fetch.uid?, fetch.body()?.to_vec())))
            .collect())
    }

    async fn add_flags(&mut self, uids: &[u32], flags: &str) -> AppResult<()> {
        if uids.is_empty() {
            return Ok(());
        }
        self.store(uids, format!("+FLAGS.SILENT {flags}")).await
    }

    async fn move_messages(&mut self, uids: &[u32], destination: &str) -> AppResult<()> {
        if uids.is_empty() {
            return Ok(());
        }
        let socket = self.socket;
        let set = uid_set(uids);
        let encoded = utf7_imap::encode_utf7_imap(destination.to_owned());
        if self.supports_move {
            let session = self.session()?;
            return bounded(socket, "UID MOVE", session.uid_mv(set, encoded)).await;
        }

        // No MOVE extension: copy, flag and expunge just these UIDs
        let session = self.session()?;
        bounded(socket, "UID COPY", session.uid_copy(set.clone(), encoded)).await?;
        self.store(uids, "+FLAGS.SILENT (\\Deleted)".to_owned()).await?;
        let session = self.session()?;
        let stream = bounded(socket, "UID EXPUNGE", session.uid_expunge(set)).await?;
        let _: Vec<u32> = bounded(socket, "UID EXPUNGE stream", stream.try_collect()).await?;
        Ok(())
    }

    async fn idle(&mut self, wait: Duration) -> AppResult<Vec<ChangeKind>> {
        let socket = self.socket;
        let session = self
            .session
            .take()
            .ok_or_else(|| AppError::Protocol("IMAP session lost during IDLE".to_owned()))?;
        let mut handle = session.idle();
        bounded(socket, "IDLE", handle.init()).await?;

        let outcome = {
            // Dropping the stop source interrupts the wait, keep it alive
            let (response, _stop) = handle.wait_with_timeout(wait);
            response.await
        };
        let kinds = match outcome {
            Ok(IdleResponse::NewData(data)) => {
                change_from_response(data.parsed()).into_iter().collect()
            }
            Ok(IdleResponse::Timeout | IdleResponse::ManualInterrupt) => Vec::new(),
            Err(e) => return Err(AppError::Protocol(format!("IDLE wait failed: {e}"))),
        };

        let session = bounded(socket, "IDLE DONE", handle.done()).await?;
        self.session = Some(session);
        Ok(kinds)
    }
}

#[cfg(test)]
mod tests {
    use async_imap::imap_proto::{MailboxDatum, Response};

    use super::{change_from_response, uid_set};
    use crate::protocol::ChangeKind;

    #[test]
    fn uid_set_compresses_runs() {
        assert_eq!(uid_set(&[]), "");
        assert_eq!(uid_set(&[7]), "7");
        assert_eq!(uid_set(&[3, 1, 2, 7, 9, 10, 2]), "1:3,7,9:10");
        assert_eq!(uid_set(&[u32::MAX - 1, u32::MAX]), format!("{}:{}", u32::MAX - 1, u32::MAX));
    }

    #[test]
    fn classifies_idle_responses() {
        assert_eq!(
            change_from_response(&Response::MailboxData(MailboxDatum::Exists(12))),
            Some(ChangeKind::MessageAdded)
        );
        assert_eq!(
            change_from_response(&Response::Expunge(4)),
            Some(ChangeKind::MessageRemoved)
        );
        assert_eq!(
            change_from_response(&Response::MailboxData(MailboxDatum::Recent(1))),
            None
        );
    }
}
