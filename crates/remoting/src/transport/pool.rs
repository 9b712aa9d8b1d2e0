//! Per-destination connection pooling.

use crate::config::ClientConfig;
use crate::error::{ConfigError, Error, Result, SessionError};
use crate::protocol::Codec;
use crate::transport::connection::PooledConnection;
use crate::transport::selector::SelectionStrategy;
use crate::transport::session::{Connector, ResponseHandler, Session};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, interval, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settings of a [`ConnectionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum live connections per address.
    pub max_connections: usize,
    /// Idle lifetime of a connection.
    pub ttl: Duration,
    /// Deadline for creating a connection or waiting for a free one.
    pub connect_timeout: Duration,
    /// Sessions opened per connection.
    pub sessions_per_connection: usize,
}

impl PoolSettings {
    /// Validate the settings.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first non-positive field.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let zero = |field: &'static str| ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_string(),
        };

        if self.max_connections == 0 {
            return Err(zero("pool_size"));
        }
        if self.ttl.is_zero() {
            return Err(zero("pool_ttl"));
        }
        if self.connect_timeout.is_zero() {
            return Err(zero("connect_timeout"));
        }
        if self.sessions_per_connection == 0 {
            return Err(zero("connection_number"));
        }
        Ok(())
    }

    /// Interval of the background sweep of expired idle connections.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        (self.ttl / 2).clamp(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl From<&ClientConfig> for PoolSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_connections: config.pool_size,
            ttl: config.pool_ttl,
            connect_timeout: config.connect_timeout,
            sessions_per_connection: config.connection_number,
        }
    }
}

/// Connection counts for one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live connections, loaned or idle, including ones being established.
    pub live: usize,
    /// Connections waiting in the pool.
    pub idle: usize,
}

#[derive(Default)]
struct SlotState {
    idle: VecDeque<Arc<PooledConnection>>,
    live: HashMap<u64, Arc<PooledConnection>>,
    connecting: usize,
}

impl SlotState {
    fn count(&self) -> usize {
        self.live.len() + self.connecting
    }
}

/// Connection state for one destination address.
///
/// Each address has its own lock so unrelated destinations never contend.
pub(crate) struct AddressSlot {
    addr: String,
    state: Mutex<SlotState>,
    available: Notify,
}

impl AddressSlot {
    fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            state: Mutex::new(SlotState::default()),
            available: Notify::new(),
        }
    }

    /// Forget a closed connection and wake one waiter.
    pub(crate) fn release(&self, conn_id: u64) {
        {
            let mut state = self.state.lock();
            state.live.remove(&conn_id);
            state.idle.retain(|conn| conn.id() != conn_id);
        }
        self.available.notify_one();
    }

    fn abandon_reservation(&self) {
        {
            let mut state = self.state.lock();
            state.connecting = state.connecting.saturating_sub(1);
        }
        self.available.notify_one();
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            live: state.count(),
            idle: state.idle.len(),
        }
    }
}

/// A claimed place for a connection being established.
///
/// Dropped without being committed, it hands the place back, so an
/// `acquire` cancelled mid-connect does not shrink the pool for good.
struct Reservation {
    slot: Arc<AddressSlot>,
    committed: bool,
}

impl Reservation {
    fn commit(mut self, conn: &Arc<PooledConnection>) {
        {
            let mut state = self.slot.state.lock();
            state.connecting = state.connecting.saturating_sub(1);
            state.live.insert(conn.id(), Arc::clone(conn));
        }
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.slot.abandon_reservation();
        }
    }
}

enum Checkout {
    Reuse(Arc<PooledConnection>),
    Expired(Arc<PooledConnection>),
    Create(Reservation),
    Wait,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn ResponseHandler>,
    selection: SelectionStrategy,
    settings: PoolSettings,
    slots: DashMap<String, Arc<AddressSlot>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Bounded pool of connections keyed by destination address.
///
/// At most `max_connections` connections exist per address. Idle
/// connections past their TTL are closed lazily on `acquire` and by a
/// background sweep started with [`ConnectionPool::start`].
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.inner.settings)
            .field("addresses", &self.inner.slots.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create a pool.
    ///
    /// Sessions are opened through `connector`, encode with `codec`, and
    /// deliver responses to `handler`.
    ///
    /// # Errors
    ///
    /// Returns an error if `settings` is invalid.
    pub fn new(
        connector: Arc<dyn Connector>,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ResponseHandler>,
        settings: PoolSettings,
        selection: SelectionStrategy,
    ) -> Result<Self> {
        settings.validate()?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                codec,
                handler,
                selection,
                settings,
                slots: DashMap::new(),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Pool settings.
    #[must_use]
    pub fn settings(&self) -> PoolSettings {
        self.inner.settings
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Token cancelled when the pool closes.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Start the background sweep of expired idle connections.
    pub fn start(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            pool.sweep_loop().await;
        });
    }

    /// Take a connection to `addr` out of the pool, creating one if none is
    /// idle and the address is below capacity.
    ///
    /// At capacity this waits up to the connect timeout for a connection to
    /// be returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClosed`] after [`close`](Self::close),
    /// [`Error::PoolExhausted`] if nothing became available in time, or
    /// [`Error::Connect`] if establishing a connection failed.
    pub async fn acquire(&self, addr: &str) -> Result<Arc<PooledConnection>> {
        let settings = self.inner.settings;
        let deadline = Instant::now() + settings.connect_timeout;
        let slot = self.slot(addr)?;

        loop {
            if self.is_closed() {
                return Err(Error::PoolClosed);
            }

            match self.checkout(&slot) {
                Checkout::Reuse(conn) => {
                    debug!("reusing connection {} to {}", conn.id(), addr);
                    return Ok(conn);
                }
                Checkout::Expired(conn) => {
                    debug!("discarding expired connection {} to {}", conn.id(), addr);
                    conn.close().await;
                }
                Checkout::Create(reservation) => return self.create(reservation, deadline).await,
                Checkout::Wait => {
                    let woken = tokio::select! {
                        woken = timeout_at(deadline, slot.available.notified()) => woken.is_ok(),
                        () = self.inner.shutdown.cancelled() => return Err(Error::PoolClosed),
                    };
                    if !woken {
                        warn!("no connection to {} available after {:?}", addr, settings.connect_timeout);
                        return Err(Error::PoolExhausted {
                            addr: addr.to_string(),
                            waited: settings.connect_timeout,
                        });
                    }
                }
            }
        }
    }

    /// Return a loaned connection to the pool.
    ///
    /// Closed connections are dropped, and returning to a closed pool closes
    /// the connection.
    pub async fn put(&self, conn: Arc<PooledConnection>) {
        if !conn.mark_idle() {
            warn!("connection {} returned to the pool twice", conn.id());
            return;
        }
        if conn.is_closed() {
            return;
        }
        if self.is_closed() || !conn.is_healthy() {
            conn.close().await;
            return;
        }

        let slot = self.inner.slots.get(conn.addr()).map(|s| Arc::clone(s.value()));
        let Some(slot) = slot else {
            conn.close().await;
            return;
        };

        let orphan = {
            let mut state = slot.state.lock();
            if state.live.contains_key(&conn.id()) {
                state.idle.push_back(conn);
                None
            } else {
                Some(conn)
            }
        };

        match orphan {
            Some(conn) => conn.close().await,
            None => slot.available.notify_one(),
        }
    }

    /// Close a connection and remove it from the pool.
    pub async fn remove(&self, conn: &PooledConnection) {
        conn.close().await;
    }

    /// Close every idle connection that has outlived the TTL.
    pub async fn evict_expired(&self) -> usize {
        let ttl = self.inner.settings.ttl;
        let now = Instant::now();
        let mut expired = Vec::new();

        for entry in &self.inner.slots {
            let mut state = entry.value().state.lock();
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|conn| conn.is_idle_expired(ttl, now) || !conn.is_healthy());
            state.idle = fresh;
            expired.extend(stale);
        }

        let count = expired.len();
        for conn in expired {
            debug!("sweeping idle connection {} to {}", conn.id(), conn.addr());
            conn.close().await;
        }
        count
    }

    /// Snapshot of the idle connections across all addresses.
    #[must_use]
    pub fn idle_connections(&self) -> Vec<Arc<PooledConnection>> {
        self.inner
            .slots
            .iter()
            .flat_map(|entry| entry.value().state.lock().idle.iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Connection counts for `addr`.
    #[must_use]
    pub fn stats(&self, addr: &str) -> PoolStats {
        self.inner
            .slots
            .get(addr)
            .map(|slot| slot.stats())
            .unwrap_or_default()
    }

    /// Close the pool and every connection it owns, loaned or idle.
    ///
    /// Later calls to `acquire` fail with [`Error::PoolClosed`]. Calling this
    /// more than once has no further effect.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("closing connection pool");
        self.inner.shutdown.cancel();

        let owned: Vec<Arc<PooledConnection>> = self
            .inner
            .slots
            .iter()
            .flat_map(|entry| {
                let mut state = entry.value().state.lock();
                state.idle.clear();
                state.live.drain().map(|(_, conn)| conn).collect::<Vec<_>>()
            })
            .collect();

        for conn in owned {
            conn.close().await;
        }
    }

    fn slot(&self, addr: &str) -> Result<Arc<AddressSlot>> {
        if addr.is_empty() {
            return Err(Error::InvalidAddress(addr.to_string()));
        }
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        Ok(Arc::clone(
            self.inner
                .slots
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(AddressSlot::new(addr)))
                .value(),
        ))
    }

    fn checkout(&self, slot: &Arc<AddressSlot>) -> Checkout {
        let settings = self.inner.settings;
        let now = Instant::now();
        let mut state = slot.state.lock();

        if let Some(conn) = state.idle.pop_back() {
            if conn.is_idle_expired(settings.ttl, now) || !conn.is_healthy() {
                return Checkout::Expired(conn);
            }
            conn.mark_busy();
            return Checkout::Reuse(conn);
        }

        if state.count() < settings.max_connections {
            state.connecting += 1;
            Checkout::Create(Reservation {
                slot: Arc::clone(slot),
                committed: false,
            })
        } else {
            Checkout::Wait
        }
    }

    async fn create(&self, reservation: Reservation, deadline: Instant) -> Result<Arc<PooledConnection>> {
        let settings = self.inner.settings;
        let slot = Arc::clone(&reservation.slot);
        let addr = slot.addr.as_str();

        let sessions = match timeout_at(deadline, self.open_sessions(addr)).await {
            Ok(Ok(sessions)) => sessions,
            Ok(Err(source)) => {
                return Err(Error::Connect {
                    addr: addr.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(Error::Connect {
                    addr: addr.to_string(),
                    source: SessionError::ConnectTimeout(settings.connect_timeout),
                });
            }
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel);
        let conn = Arc::new(PooledConnection::new(
            id,
            addr.to_string(),
            sessions,
            self.inner.selection.build(),
            Arc::downgrade(&slot),
        ));
        reservation.commit(&conn);

        if self.is_closed() {
            conn.close().await;
            return Err(Error::PoolClosed);
        }

        debug!("created connection {} to {}", id, addr);
        Ok(conn)
    }

    async fn open_sessions(&self, addr: &str) -> std::result::Result<Vec<Arc<dyn Session>>, SessionError> {
        let count = self.inner.settings.sessions_per_connection;
        let mut sessions: Vec<Arc<dyn Session>> = Vec::with_capacity(count);

        for _ in 0..count {
            let opened = self
                .inner
                .connector
                .connect(
                    addr,
                    Arc::clone(&self.inner.codec),
                    Arc::clone(&self.inner.handler),
                )
                .await;

            match opened {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    for session in sessions {
                        session.close().await;
                    }
                    return Err(e);
                }
            }
        }

        Ok(sessions)
    }

    async fn sweep_loop(&self) {
        let period = self.inner.settings.sweep_interval();
        let mut ticker = interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.evict_expired().await;
                    if evicted > 0 {
                        debug!("swept {} expired connections", evicted);
                    }
                }
                () = self.inner.shutdown.cancelled() => break,
            }
        }
    }
}
