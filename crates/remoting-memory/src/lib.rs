//! In-memory sessions for testing.
//!
//! A [`MemoryConnector`] opens sessions to a scriptable [`MemoryPeer`] living
//! in the same process. Frames still go through the client's codec in both
//! directions, so everything above the socket behaves as it would over TCP.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use proven_remoting::{Codec, Connector, Request, ResponseHandler, Response, Session, SessionError};
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// How the peer answers two-way requests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Reply {
    /// Answer with the request's payload.
    #[default]
    Echo,
    /// Answer with an error response carrying this message.
    Error(String),
    /// Never answer.
    Silent,
}

#[derive(Debug, Clone, Default)]
struct Script {
    reply: Reply,
    delay: Option<Duration>,
    write_stall: Option<Duration>,
    ignore_heartbeats: bool,
    fail_writes: bool,
    refuse_connections: bool,
}

struct Link {
    codec: Arc<dyn Codec>,
    tx: flume::Sender<Bytes>,
    closed: Arc<AtomicBool>,
}

/// The far end of every session opened by a [`MemoryConnector`].
#[derive(Default)]
pub struct MemoryPeer {
    script: RwLock<Script>,
    links: Mutex<HashMap<u64, Link>>,
    received: Mutex<Vec<Request>>,
    connects: AtomicUsize,
    heartbeats: AtomicUsize,
}

impl Debug for MemoryPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPeer")
            .field("script", &*self.script.read())
            .field("sessions", &self.links.lock().len())
            .field("connects", &self.connects())
            .finish_non_exhaustive()
    }
}

impl MemoryPeer {
    /// A peer that echoes every request immediately.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set how two-way requests are answered.
    pub fn set_reply(&self, reply: Reply) {
        self.script.write().reply = reply;
    }

    /// Delay every answer by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.script.write().delay = delay;
    }

    /// Hold every write for `stall` before it is accepted.
    pub fn set_write_stall(&self, stall: Option<Duration>) {
        self.script.write().write_stall = stall;
    }

    /// Stop answering heartbeats while still answering calls.
    pub fn set_ignore_heartbeats(&self, ignore: bool) {
        self.script.write().ignore_heartbeats = ignore;
    }

    /// Make every write on every session fail with a broken pipe.
    pub fn set_fail_writes(&self, fail: bool) {
        self.script.write().fail_writes = fail;
    }

    /// Refuse new sessions.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.script.write().refuse_connections = refuse;
    }

    /// Sessions opened so far.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Sessions currently open.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.links.lock().len()
    }

    /// Heartbeats received so far.
    #[must_use]
    pub fn heartbeats(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// Non-heartbeat requests received so far, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<Request> {
        self.received.lock().clone()
    }

    /// Send `response` down every open session, unsolicited.
    ///
    /// Used to deliver late or duplicate responses.
    pub fn push(&self, response: &Response) {
        for (id, link) in self.links.lock().iter() {
            match link.codec.encode_response(response) {
                Ok(frame) => {
                    let _ = link.tx.send(frame);
                }
                Err(e) => warn!("memory session {}: failed to encode response: {}", id, e),
            }
        }
    }

    /// Close every session from the peer side.
    pub fn sever(&self) {
        for (_, link) in self.links.lock().drain() {
            link.closed.store(true, Ordering::Release);
        }
    }

    fn answer(&self, request: &Request) -> Option<(Response, Option<Duration>)> {
        let script = self.script.read().clone();

        if request.is_heartbeat() {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            return (!script.ignore_heartbeats)
                .then(|| (Response::heartbeat(request.id), script.delay));
        }

        self.received.lock().push(request.clone());
        if !request.two_way {
            return None;
        }

        match script.reply {
            Reply::Echo => Some((Response::echo(request), script.delay)),
            Reply::Error(message) => Some((Response::error(request.id, message), script.delay)),
            Reply::Silent => None,
        }
    }
}

/// Opens [`MemorySession`]s to a [`MemoryPeer`].
#[derive(Debug)]
pub struct MemoryConnector {
    peer: Arc<MemoryPeer>,
    next_id: AtomicU64,
}

impl MemoryConnector {
    /// Create a connector whose sessions all reach `peer`.
    #[must_use]
    pub fn new(peer: Arc<MemoryPeer>) -> Arc<Self> {
        Arc::new(Self {
            peer,
            next_id: AtomicU64::new(0),
        })
    }

    /// The peer behind this connector.
    #[must_use]
    pub const fn peer(&self) -> &Arc<MemoryPeer> {
        &self.peer
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        addr: &str,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<Arc<dyn Session>, SessionError> {
        if self.peer.script.read().refuse_connections {
            return Err(SessionError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("memory peer at {addr} refused the connection"),
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (to_peer, from_client) = flume::bounded::<Bytes>(1024);
        let (to_client, from_peer) = flume::unbounded::<Bytes>();
        let closed = Arc::new(AtomicBool::new(false));

        self.peer.links.lock().insert(
            id,
            Link {
                codec: Arc::clone(&codec),
                tx: to_client.clone(),
                closed: Arc::clone(&closed),
            },
        );
        self.peer.connects.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(serve(
            id,
            Arc::clone(&self.peer),
            Arc::clone(&codec),
            from_client,
            to_client,
        ));
        tokio::spawn(deliver(
            id,
            Arc::clone(&codec),
            handler,
            from_peer,
            Arc::clone(&closed),
        ));

        debug!("opened memory session {} to {}", id, addr);
        Ok(Arc::new(MemorySession {
            id,
            peer: Arc::clone(&self.peer),
            codec,
            tx: Mutex::new(Some(to_peer)),
            closed,
        }))
    }
}

/// Client end of an in-memory session.
pub struct MemorySession {
    id: u64,
    peer: Arc<MemoryPeer>,
    codec: Arc<dyn Codec>,
    tx: Mutex<Option<flume::Sender<Bytes>>>,
    closed: Arc<AtomicBool>,
}

impl Debug for MemorySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySession")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn write(&self, request: &Request, timeout: Duration) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        if self.peer.script.read().fail_writes {
            self.closed.store(true, Ordering::Release);
            return Err(SessionError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "memory peer dropped the write",
            )));
        }

        let frame = self.codec.encode_request(request)?;
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return Err(SessionError::Closed);
        };

        let stall = self.peer.script.read().write_stall;
        let sent = tokio::time::timeout(timeout, async {
            if let Some(stall) = stall {
                tokio::time::sleep(stall).await;
            }
            tx.send_async(frame).await
        });

        match sent.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::WriteTimeout(timeout)),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if self.tx.lock().take().is_some() {
            self.peer.links.lock().remove(&self.id);
            debug!("closed memory session {}", self.id);
        }
    }
}

async fn serve(
    id: u64,
    peer: Arc<MemoryPeer>,
    codec: Arc<dyn Codec>,
    from_client: flume::Receiver<Bytes>,
    to_client: flume::Sender<Bytes>,
) {
    while let Ok(frame) = from_client.recv_async().await {
        let request = match codec.decode_request(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!("memory session {}: failed to decode request: {}", id, e);
                continue;
            }
        };

        let Some((response, delay)) = peer.answer(&request) else {
            continue;
        };
        let frame = match codec.encode_response(&response) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("memory session {}: failed to encode response: {}", id, e);
                continue;
            }
        };

        match delay {
            Some(delay) => {
                let to_client = to_client.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = to_client.send(frame);
                });
            }
            None => {
                let _ = to_client.send(frame);
            }
        }
    }
}

async fn deliver(
    id: u64,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn ResponseHandler>,
    from_peer: flume::Receiver<Bytes>,
    closed: Arc<AtomicBool>,
) {
    while let Ok(frame) = from_peer.recv_async().await {
        if closed.load(Ordering::Acquire) {
            break;
        }
        match codec.decode_response(&frame) {
            Ok(response) => handler.handle_response(response),
            Err(e) => warn!("memory session {}: failed to decode response: {}", id, e),
        }
    }
    debug!("memory session {} reader finished", id);
}
