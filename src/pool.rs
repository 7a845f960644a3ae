//! Bounded pool of authenticated IMAP sessions
//!
//! A semaphore with `capacity` permits bounds the number of sessions in use;
//! idle sessions are kept for reuse. A session only ever exists while it is
//! checked out or parked in the idle list, so at most `capacity` sessions are
//! open at any time. Sessions are opened lazily.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::protocol::{Connector, MailConnection};

/// A claimed pool slot with no session attached yet
#[derive(Debug)]
pub struct Reservation {
    permit: OwnedSemaphorePermit,
}

/// A session checked out of the pool
///
/// Hand it back with [`ConnectionPool::release`] or
/// [`ConnectionPool::release_broken`]. Dropping it discards the session and
/// frees the slot.
pub struct PooledConnection<T: MailConnection> {
    conn: Option<T>,
    open: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl<T: MailConnection> PooledConnection<T> {
    /// Borrow the live session
    ///
    /// Fails when a renewal could not reconnect.
    pub fn session(&mut self) -> AppResult<&mut T> {
        self.conn
            .as_mut()
            .ok_or_else(|| AppError::Protocol("pooled session was discarded".to_owned()))
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.conn.as_ref().map(MailConnection::connection_id)
    }

    fn discard(&mut self) {
        if self.conn.take().is_some() {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl<T: MailConnection> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        self.discard();
    }
}

/// Point-in-time pool gauges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub open: usize,
    pub idle: usize,
    pub available: usize,
}

/// Type-erased view of a pool for code that does not know its connector
pub trait PoolHandle: Send + Sync {
    fn snapshot(&self) -> PoolSnapshot;

    fn close_idle(&self);
}

pub struct ConnectionPool<C: Connector> {
    connector: Arc<C>,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<C::Connection>>,
    open: Arc<AtomicUsize>,
    capacity: usize,
    acquire_timeout: Duration,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: Arc<C>, capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            connector,
            slots: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(Vec::with_capacity(capacity)),
            open: Arc::new(AtomicUsize::new(0)),
            capacity,
            acquire_timeout,
        }
    }

    /// Wait for a free slot without opening a session
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` when no slot frees within the acquire timeout.
    pub async fn reserve(&self) -> AppResult<Reservation> {
        let slot = Arc::clone(&self.slots).acquire_owned();
        let permit = tokio::time::timeout(self.acquire_timeout, slot)
            .await
            .map_err(|_| {
                AppError::ResourceExhausted(format!(
                    "no connection available within {} ms",
                    self.acquire_timeout.as_millis()
                ))
            })?
            .map_err(|_| AppError::Internal("connection pool closed".to_owned()))?;
        Ok(Reservation { permit })
    }

    /// Turn a reservation into a session, reusing an idle one if possible
    pub async fn checkout(
        &self,
        reservation: Reservation,
    ) -> AppResult<PooledConnection<C::Connection>> {
        let parked = self.lock_idle()?.pop();
        let conn = match parked {
            Some(conn) => conn,
            None => self.connect().await?,
        };
        Ok(PooledConnection {
            conn: Some(conn),
            open: Arc::clone(&self.open),
            _permit: reservation.permit,
        })
    }

    /// Reserve a slot and check out a session
    pub async fn acquire(&self) -> AppResult<PooledConnection<C::Connection>> {
        let reservation = self.reserve().await?;
        self.checkout(reservation).await
    }

    /// Return a healthy session for reuse
    pub fn release(&self, mut conn: PooledConnection<C::Connection>) {
        if let Some(session) = conn.conn.take() {
            match self.lock_idle() {
                Ok(mut idle) => idle.push(session),
                Err(e) => {
                    warn!(error = %e, "dropping session returned to poisoned pool");
                    self.open.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// Discard a session after a protocol failure
    ///
    /// The slot is freed; the next checkout opens a fresh session.
    pub fn release_broken(&self, mut conn: PooledConnection<C::Connection>) {
        if let Some(id) = conn.connection_id() {
            debug!(connection = id, "discarding broken session");
        }
        conn.discard();
    }

    /// Replace the session held in `conn` while keeping its slot
    pub async fn renew(&self, conn: &mut PooledConnection<C::Connection>) -> AppResult<()> {
        conn.discard();
        let fresh = self.connect().await?;
        conn.conn = Some(fresh);
        Ok(())
    }

    /// Drop all parked sessions
    pub fn close_idle(&self) {
        if let Ok(mut idle) = self.lock_idle() {
            let closed = idle.len();
            idle.clear();
            self.open.fetch_sub(closed, Ordering::SeqCst);
        }
    }

    async fn connect(&self) -> AppResult<C::Connection> {
        let conn = self.connector.connect().await?;
        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(connection = conn.connection_id(), open, "opened pooled session");
        Ok(conn)
    }

    fn lock_idle(&self) -> AppResult<std::sync::MutexGuard<'_, Vec<C::Connection>>> {
        self.idle
            .lock()
            .map_err(|_| AppError::Internal("connection pool mutex poisoned".to_owned()))
    }
}

impl<C: Connector> PoolHandle for ConnectionPool<C> {
    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            capacity: self.capacity,
            open: self.open.load(Ordering::SeqCst),
            idle: self.idle.lock().map_or(0, |idle| idle.len()),
            available: self.slots.available_permits(),
        }
    }

    fn close_idle(&self) {
        ConnectionPool::close_idle(self);
    }
}
