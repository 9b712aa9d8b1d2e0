//! Client facade: connect to one destination and issue calls over its pool.

use crate::config::{ClientConfig, ConfigRegistry};
use crate::error::{Error, Result};
use crate::heartbeat::HeartbeatMonitor;
use crate::pending::{AsyncCallback, CallTiming, OwnerId, PendingResponses};
use crate::protocol::{CodecRegistry, Request, Response};
use crate::transport::{
    ConnectionPool, Connector, PoolSettings, PooledConnection, ResponseHandler, SelectionStrategy,
    Session, TcpConnector,
};
use crate::worker::TaskPool;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Per-client overrides of the protocol configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Overrides `connect_timeout` of the protocol configuration. `None` or
    /// zero keeps the configured value.
    pub connect_timeout: Option<Duration>,
}

/// Write `request` to `session`, wrapping any failure with the destination.
///
/// Marks the start of the read phase on `timing` once the write returns.
pub(crate) async fn transfer(
    addr: &str,
    session: &dyn Session,
    request: &Request,
    timeout: Duration,
    timing: Option<&CallTiming>,
) -> Result<()> {
    session
        .write(request, timeout)
        .await
        .map_err(|source| Error::Write {
            addr: addr.to_string(),
            request_id: request.id,
            source,
        })?;

    if let Some(timing) = timing {
        timing.mark_read_start();
    }
    Ok(())
}

/// Routes inbound responses to the pending table, then to the observer.
struct InboundRouter {
    pending: Arc<PendingResponses>,
    observer: Arc<RwLock<Option<Arc<dyn ResponseHandler>>>>,
}

impl ResponseHandler for InboundRouter {
    fn handle_response(&self, response: Response) {
        let observer = self.observer.read().clone();
        match observer {
            Some(observer) => {
                self.pending.fulfill(response.clone());
                observer.handle_response(response);
            }
            None => {
                self.pending.fulfill(response);
            }
        }
    }
}

/// A connection on loan to one call.
///
/// It must be settled with [`Loan::put`] or [`Loan::remove`]. A loan dropped
/// unsettled, because its call was cancelled, may have a write cut short, so
/// the connection is retired at once and its sessions closed in the
/// background.
struct Loan {
    pool: ConnectionPool,
    conn: Arc<PooledConnection>,
    settled: bool,
}

impl Loan {
    async fn acquire(pool: &ConnectionPool, addr: &str) -> Result<Self> {
        let conn = pool.acquire(addr).await?;
        Ok(Self {
            pool: pool.clone(),
            conn,
            settled: false,
        })
    }

    async fn put(mut self) {
        self.settled = true;
        self.pool.put(Arc::clone(&self.conn)).await;
    }

    async fn remove(mut self) {
        self.settled = true;
        self.pool.remove(&self.conn).await;
    }

    /// Return the connection after a successful write, or close it after a
    /// failed one.
    async fn settle(self, failure: Option<Error>) -> Result<Option<Response>> {
        match failure {
            None => {
                self.put().await;
                Ok(None)
            }
            Some(e) => {
                warn!("{}; closing connection {}", e, self.conn.id());
                self.remove().await;
                Err(e)
            }
        }
    }
}

impl Deref for Loan {
    type Target = PooledConnection;

    fn deref(&self) -> &PooledConnection {
        &self.conn
    }
}

impl Drop for Loan {
    fn drop(&mut self) {
        if self.settled || !self.conn.retire() {
            return;
        }

        debug!("call abandoned, retiring connection {}", self.conn.id());
        if let Ok(handle) = Handle::try_current() {
            let conn = Arc::clone(&self.conn);
            handle.spawn(async move { conn.close_sessions().await });
        }
    }
}

struct Connected {
    addr: String,
    protocol: String,
    config: Arc<ClientConfig>,
    pool: ConnectionPool,
    heartbeat: JoinHandle<()>,
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    connector: Option<Arc<dyn Connector>>,
    configs: Option<Arc<ConfigRegistry>>,
    codecs: Option<Arc<CodecRegistry>>,
    pending: Option<Arc<PendingResponses>>,
    selection: SelectionStrategy,
    options: Options,
}

impl ClientBuilder {
    /// Create a builder with TCP sessions and default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connector: None,
            configs: None,
            codecs: None,
            pending: None,
            selection: SelectionStrategy::default(),
            options: Options::default(),
        }
    }

    /// Open sessions with `connector` instead of TCP.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Resolve protocol configuration from `configs`.
    #[must_use]
    pub fn configs(mut self, configs: Arc<ConfigRegistry>) -> Self {
        self.configs = Some(configs);
        self
    }

    /// Resolve codecs from `codecs`.
    #[must_use]
    pub fn codecs(mut self, codecs: Arc<CodecRegistry>) -> Self {
        self.codecs = Some(codecs);
        self
    }

    /// Correlate responses through `pending` instead of a private table.
    #[must_use]
    pub fn pending_responses(mut self, pending: Arc<PendingResponses>) -> Self {
        self.pending = Some(pending);
        self
    }

    /// Session selection inside each pooled connection.
    #[must_use]
    pub const fn selection(mut self, selection: SelectionStrategy) -> Self {
        self.selection = selection;
        self
    }

    /// Per-client overrides.
    #[must_use]
    pub const fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Build the client. It is not connected until [`Client::connect`].
    #[must_use]
    pub fn build(self) -> Client {
        let pending = self
            .pending
            .unwrap_or_else(|| Arc::new(PendingResponses::new(Arc::new(TaskPool::disabled()))));

        Client {
            connector: self.connector,
            configs: self
                .configs
                .unwrap_or_else(|| Arc::new(ConfigRegistry::new())),
            codecs: self.codecs.unwrap_or_default(),
            owner: pending.owner(),
            pending,
            selection: self.selection,
            options: self.options,
            observer: Arc::new(RwLock::new(None)),
            state: Mutex::new(None),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Client for one destination.
///
/// `connect` builds the connection pool for the destination, `request`
/// loans a connection for one write and waits for the response when the
/// call is synchronous, and `close` tears everything down.
pub struct Client {
    connector: Option<Arc<dyn Connector>>,
    configs: Arc<ConfigRegistry>,
    codecs: Arc<CodecRegistry>,
    pending: Arc<PendingResponses>,
    owner: OwnerId,
    selection: SelectionStrategy,
    options: Options,
    observer: Arc<RwLock<Option<Arc<dyn ResponseHandler>>>>,
    state: Mutex<Option<Connected>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Client")
            .field("addr", &state.as_ref().map(|c| c.addr.as_str()))
            .field("protocol", &state.as_ref().map(|c| c.protocol.as_str()))
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect to the destination named by `url`.
    ///
    /// The scheme selects the protocol configuration and codec, the host and
    /// port form the address. Connecting again replaces the previous pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the URL has no host or port,
    /// [`Error::UnknownCodec`] if no codec is registered for the scheme, or
    /// a configuration error if the resolved settings are invalid.
    #[instrument(skip(self, url), fields(url = %url))]
    pub async fn connect(&self, url: &Url) -> Result<()> {
        let protocol = url.scheme().to_string();
        let addr = match (url.host_str(), url.port_or_known_default()) {
            (Some(host), Some(port)) if !host.is_empty() => format!("{host}:{port}"),
            _ => return Err(Error::InvalidAddress(url.to_string())),
        };

        let mut config = (*self.configs.resolve(&protocol)).clone();
        if let Some(connect_timeout) = self.options.connect_timeout.filter(|t| !t.is_zero()) {
            config.connect_timeout = connect_timeout;
        }
        config.validate()?;

        let codec = self
            .codecs
            .get(&protocol)
            .ok_or_else(|| Error::UnknownCodec(protocol.clone()))?;

        let connector = self.connector.clone().unwrap_or_else(|| {
            Arc::new(TcpConnector::new().with_session_timeout(config.session_timeout))
        });
        let router = Arc::new(InboundRouter {
            pending: Arc::clone(&self.pending),
            observer: Arc::clone(&self.observer),
        });
        let pool = ConnectionPool::new(
            connector,
            codec,
            router,
            PoolSettings::from(&config),
            self.selection,
        )?;
        pool.start();

        let heartbeat =
            HeartbeatMonitor::new(pool.clone(), Arc::clone(&self.pending), &config).start();
        self.pending.workers().reconfigure(config.worker_settings());

        let previous = self.state.lock().replace(Connected {
            addr: addr.clone(),
            protocol,
            config: Arc::new(config),
            pool,
            heartbeat,
        });
        if let Some(previous) = previous {
            debug!("replacing connection to {}", previous.addr);
            previous.pool.close().await;
            previous.heartbeat.abort();
        }

        info!("client connected to {}", addr);
        Ok(())
    }

    /// Destination address, if connected.
    #[must_use]
    pub fn address(&self) -> Option<String> {
        self.state.lock().as_ref().map(|c| c.addr.clone())
    }

    /// Resolved configuration of the current connection.
    #[must_use]
    pub fn config(&self) -> Option<Arc<ClientConfig>> {
        self.state.lock().as_ref().map(|c| Arc::clone(&c.config))
    }

    /// Connection pool of the current connection.
    #[must_use]
    pub fn pool(&self) -> Option<ConnectionPool> {
        self.state.lock().as_ref().map(|c| c.pool.clone())
    }

    /// Whether `connect` succeeded and `close` has not been called since.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Receive every inbound response after it has been matched to its call.
    pub fn set_response_handler(&self, handler: impl ResponseHandler) {
        *self.observer.write() = Some(Arc::new(handler));
    }

    /// Registry correlating this client's calls with their responses.
    #[must_use]
    pub fn pending_responses(&self) -> &Arc<PendingResponses> {
        &self.pending
    }

    /// Issue one call.
    ///
    /// A one-way request returns `None` once written. A two-way request with
    /// a `callback` also returns `None` once written; the callback later
    /// runs once with the response or a read timeout. A two-way request
    /// without a callback waits up to `timeout` and returns the response.
    ///
    /// The connection goes back to the pool as soon as the write succeeds.
    /// If the write fails the connection is closed instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTimeout`] for a zero timeout,
    /// [`Error::InvalidRequest`] for a one-way request with a callback,
    /// [`Error::NotConnected`] before `connect`, pool errors when no
    /// connection is available, [`Error::Write`] when the write fails,
    /// [`Error::ReadTimeout`] when a synchronous call gets no response in
    /// time, and [`Error::Remote`] when the peer answered with an error.
    #[instrument(skip(self, request, callback), fields(request_id = %request.id, two_way = request.two_way))]
    pub async fn request(
        &self,
        request: Request,
        timeout: Duration,
        callback: Option<AsyncCallback>,
    ) -> Result<Option<Response>> {
        if timeout.is_zero() {
            return Err(Error::InvalidTimeout);
        }
        if callback.is_some() && !request.two_way {
            return Err(Error::InvalidRequest(
                "callback supplied with a one-way request".to_string(),
            ));
        }

        let (pool, addr) = {
            let state = self.state.lock();
            let connected = state.as_ref().ok_or(Error::NotConnected)?;
            (connected.pool.clone(), connected.addr.clone())
        };

        let loan = Loan::acquire(&pool, &addr).await?;
        let Some(session) = loan.select_session() else {
            warn!("connection {} to {} has no open session", loan.id(), addr);
            loan.remove().await;
            return Err(Error::SessionNotExist(addr));
        };

        if !request.two_way {
            let written = transfer(&addr, &*session, &request, timeout, None).await;
            drop(session);
            return loan.settle(written.err()).await;
        }

        if let Some(callback) = callback {
            let timing = self
                .pending
                .register_callback(self.owner, request.id, callback);
            self.pending.expire_after(request.id, timeout);

            let written = transfer(&addr, &*session, &request, timeout, Some(&timing)).await;
            if written.is_err() {
                self.pending.discard(&request.id);
            }
            drop(session);
            return loan.settle(written.err()).await;
        }

        let waiting = self.pending.register(self.owner, request.id);
        if let Err(e) = transfer(&addr, &*session, &request, timeout, Some(waiting.timing())).await {
            self.pending.discard(&request.id);
            drop(session);
            return loan.settle(Some(e)).await;
        }

        // The connection stays healthy whatever the wait's outcome.
        loan.put().await;
        let response = self.pending.wait(waiting, timeout).await;
        drop(session);

        response.map(Some)
    }

    /// Close the pool and fail every call of this client still waiting.
    ///
    /// Calls other clients made through a shared registry are left alone.
    /// Safe to call repeatedly, and before `connect`.
    pub async fn close(&self) {
        let connected = self.state.lock().take();
        let Some(connected) = connected else {
            return;
        };

        info!("closing client for {}", connected.addr);
        connected.pool.close().await;
        connected.heartbeat.abort();
        let failed = self.pending.close_owner(self.owner);
        if failed > 0 {
            debug!("failed {} waiting calls on close", failed);
        }
    }
}
