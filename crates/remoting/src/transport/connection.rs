//! A pooled connection: one or more sessions to the same destination.

use crate::transport::pool::AddressSlot;
use crate::transport::selector::SessionSelector;
use crate::transport::session::Session;
use futures::future::join_all;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A session together with the number of calls currently using it.
#[derive(Debug)]
pub struct SessionSlot {
    session: Arc<dyn Session>,
    in_flight: Arc<AtomicUsize>,
}

impl SessionSlot {
    /// Wrap `session`.
    #[must_use]
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self {
            session,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The wrapped session.
    #[must_use]
    pub const fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Whether the session can still be written to.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.session.is_closed()
    }

    /// Calls currently holding a lease on this session.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Count a call against this session until the lease is dropped.
    #[must_use]
    pub fn lease(&self) -> SessionLease {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        SessionLease {
            session: Arc::clone(&self.session),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

/// A session chosen for one call.
#[derive(Debug)]
pub struct SessionLease {
    session: Arc<dyn Session>,
    in_flight: Arc<AtomicUsize>,
}

impl Deref for SessionLease {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A connection owned by a [`ConnectionPool`](crate::transport::ConnectionPool).
///
/// While loaned out by `acquire` the connection is marked busy and is not
/// handed to anyone else until it is returned with `put` or closed.
pub struct PooledConnection {
    id: u64,
    addr: String,
    sessions: Vec<SessionSlot>,
    selector: Box<dyn SessionSelector>,
    created_at: Instant,
    last_used: Mutex<Instant>,
    busy: AtomicBool,
    closed: AtomicBool,
    heartbeat_failures: AtomicU32,
    slot: Weak<AddressSlot>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("sessions", &self.sessions.len())
            .field("busy", &self.is_busy())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub(crate) fn new(
        id: u64,
        addr: String,
        sessions: Vec<Arc<dyn Session>>,
        selector: Box<dyn SessionSelector>,
        slot: Weak<AddressSlot>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            addr,
            sessions: sessions.into_iter().map(SessionSlot::new).collect(),
            selector,
            created_at: now,
            last_used: Mutex::new(now),
            busy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            heartbeat_failures: AtomicU32::new(0),
            slot,
        }
    }

    /// Connection id, unique within its pool.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Destination address.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The connection's sessions.
    #[must_use]
    pub fn sessions(&self) -> &[SessionSlot] {
        &self.sessions
    }

    /// When the connection was established.
    #[must_use]
    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the connection was last returned to the pool.
    #[must_use]
    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// Whether the connection is loaned out.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Open and holding at least one open session.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        !self.is_closed() && self.sessions.iter().any(SessionSlot::is_open)
    }

    /// Whether the connection has been idle for at least `ttl`.
    #[must_use]
    pub fn is_idle_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_used()) >= ttl
    }

    /// Pick a session for one call.
    #[must_use]
    pub fn select_session(&self) -> Option<SessionLease> {
        if self.is_closed() {
            return None;
        }

        if let [only] = self.sessions.as_slice() {
            return only.is_open().then(|| only.lease());
        }

        self.selector
            .select(&self.sessions)
            .map(|index| self.sessions[index].lease())
    }

    pub(crate) fn mark_busy(&self) {
        self.busy.store(true, Ordering::Release);
    }

    /// Flip to idle; `false` if the connection was not loaned out.
    pub(crate) fn mark_idle(&self) -> bool {
        let was_busy = self.busy.swap(false, Ordering::AcqRel);
        if was_busy {
            *self.last_used.lock() = Instant::now();
        }
        was_busy
    }

    /// Record a failed heartbeat and return the consecutive failure count.
    pub(crate) fn record_heartbeat_failure(&self) -> u32 {
        self.heartbeat_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_heartbeat_failures(&self) {
        self.heartbeat_failures.store(0, Ordering::Release);
    }

    /// Consecutive failed heartbeats.
    #[must_use]
    pub fn heartbeat_failures(&self) -> u32 {
        self.heartbeat_failures.load(Ordering::Acquire)
    }

    /// Close every session and release the connection's pool slot.
    ///
    /// Safe to call any number of times, from any number of tasks. The slot
    /// is released before the sessions are closed, so a close cut short
    /// still frees capacity.
    pub async fn close(&self) {
        if self.retire() {
            self.close_sessions().await;
        }
    }

    /// Mark the connection closed and release its pool slot without
    /// touching the sessions. Returns `false` if it was already closed.
    pub(crate) fn retire(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        debug!("closing connection {} to {}", self.id, self.addr);
        if let Some(slot) = self.slot.upgrade() {
            slot.release(self.id);
        }
        true
    }

    pub(crate) async fn close_sessions(&self) {
        join_all(self.sessions.iter().map(|slot| slot.session().close())).await;
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::StubSession;
    use super::*;
    use crate::transport::selector::RoundRobin;

    fn connection(closed: &[bool]) -> (PooledConnection, Vec<Arc<StubSession>>) {
        let stubs: Vec<_> = closed
            .iter()
            .enumerate()
            .map(|(id, &closed)| Arc::new(StubSession::new(id as u64, closed)))
            .collect();
        let sessions = stubs
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn Session>)
            .collect();
        let conn = PooledConnection::new(
            1,
            "127.0.0.1:20000".to_string(),
            sessions,
            Box::<RoundRobin>::default(),
            Weak::new(),
        );
        (conn, stubs)
    }

    #[tokio::test]
    async fn test_double_close_is_noop() {
        let (conn, stubs) = connection(&[false, false]);
        assert!(conn.is_healthy());

        conn.close().await;
        conn.close().await;

        assert!(conn.is_closed());
        assert!(!conn.is_healthy());
        assert!(conn.select_session().is_none());
        for stub in stubs {
            assert_eq!(stub.closes.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_concurrent_close() {
        let (conn, stubs) = connection(&[false]);
        let conn = Arc::new(conn);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let conn = Arc::clone(&conn);
                tokio::spawn(async move { conn.close().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(stubs[0].closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lease_counts_in_flight() {
        let (conn, _stubs) = connection(&[false]);
        let lease = conn.select_session().unwrap();
        assert_eq!(conn.sessions()[0].in_flight(), 1);
        drop(lease);
        assert_eq!(conn.sessions()[0].in_flight(), 0);
    }

    #[test]
    fn test_single_closed_session_is_unusable() {
        let (conn, _stubs) = connection(&[true]);
        assert!(!conn.is_healthy());
        assert!(conn.select_session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_expiry_tracks_last_use() {
        let (conn, _stubs) = connection(&[false]);
        let ttl = Duration::from_secs(60);

        assert!(conn.mark_idle());
        assert!(!conn.mark_idle());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!conn.is_idle_expired(ttl, Instant::now()));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(conn.is_idle_expired(ttl, Instant::now()));
    }
}
