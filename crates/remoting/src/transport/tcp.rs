//! TCP sessions carrying length-delimited frames.

use crate::error::SessionError;
use crate::protocol::{Codec, Request};
use crate::transport::session::{Connector, ResponseHandler, Session};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type FrameSink = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;
type FrameStream = SplitStream<Framed<TcpStream, LengthDelimitedCodec>>;

/// Largest frame accepted in either direction.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Build the frame codec used on both ends of a TCP session.
#[must_use]
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Opens [`TcpSession`]s.
#[derive(Debug, Default)]
pub struct TcpConnector {
    next_id: AtomicU64,
    session_timeout: Option<Duration>,
}

impl TcpConnector {
    /// Create a connector whose sessions never time out while idle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Close sessions that receive nothing for `timeout`.
    #[must_use]
    pub const fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        addr: &str,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<Arc<dyn Session>, SessionError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("opened tcp session {} to {} ({})", id, addr, codec.name());

        Ok(TcpSession::start(
            id,
            addr.to_string(),
            stream,
            codec,
            handler,
            self.session_timeout,
        ))
    }
}

/// One TCP connection with a reader task decoding responses.
pub struct TcpSession {
    id: u64,
    peer: String,
    codec: Arc<dyn Codec>,
    sink: Mutex<FrameSink>,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl fmt::Debug for TcpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl TcpSession {
    fn start(
        id: u64,
        peer: String,
        stream: TcpStream,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ResponseHandler>,
        idle_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let (sink, stream) = Framed::new(stream, frame_codec()).split();
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        tokio::spawn(read_loop(
            id,
            stream,
            Arc::clone(&codec),
            handler,
            idle_timeout,
            Arc::clone(&closed),
            shutdown.clone(),
        ));

        Arc::new(Self {
            id,
            peer,
            codec,
            sink: Mutex::new(sink),
            closed,
            shutdown,
        })
    }

    /// Remote address.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl Session for TcpSession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn write(&self, request: &Request, write_timeout: Duration) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let frame = self.codec.encode_request(request)?;
        let sent = timeout(write_timeout, async {
            let mut sink = self.sink.lock().await;
            sink.send(frame).await
        })
        .await;

        match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("write to {} failed on session {}: {}", self.peer, self.id, e);
                self.closed.store(true, Ordering::Release);
                self.shutdown.cancel();
                Err(SessionError::Io(e))
            }
            Err(_) => Err(SessionError::WriteTimeout(write_timeout)),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!("closing session {} to {}: {}", self.id, self.peer, e);
        }
    }
}

async fn read_loop(
    id: u64,
    mut stream: FrameStream,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn ResponseHandler>,
    idle_timeout: Option<Duration>,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        let next = async {
            match idle_timeout {
                Some(idle) => timeout(idle, stream.next()).await.ok(),
                None => Some(stream.next().await),
            }
        };

        tokio::select! {
            frame = next => match frame {
                Some(Some(Ok(frame))) => match codec.decode_response(&frame) {
                    Ok(response) => handler.handle_response(response),
                    Err(e) => error!("session {}: failed to decode response: {}", id, e),
                },
                Some(Some(Err(e))) => {
                    warn!("session {}: read error: {}", id, e);
                    break;
                }
                Some(None) => {
                    debug!("session {}: peer closed the stream", id);
                    break;
                }
                None => {
                    info!("session {}: idle for {:?}, closing", id, idle_timeout.unwrap_or_default());
                    break;
                }
            },
            () = shutdown.cancelled() => break,
        }
    }

    closed.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CborCodec, Response};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, frame_codec());
            while let Some(Ok(frame)) = framed.next().await {
                let request = CborCodec.decode_request(&frame).unwrap();
                let reply = CborCodec.encode_response(&Response::echo(&request)).unwrap();
                framed.send(reply).await.unwrap();
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_request_reaches_handler() {
        let addr = echo_server().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(move |response: Response| {
            let _ = tx.send(response);
        });

        let session = TcpConnector::new()
            .connect(&addr, Arc::new(CborCodec), handler)
            .await
            .unwrap();

        let request = Request::two_way(Bytes::from_static(b"hello"));
        session.write(&request, Duration::from_secs(1)).await.unwrap();

        let response = rx.recv().await.unwrap();
        assert_eq!(response.id, request.id);
        assert_eq!(response.payload, Bytes::from_static(b"hello"));

        session.close().await;
        session.close().await;
        assert!(session.is_closed());
        assert!(matches!(
            session.write(&request, Duration::from_secs(1)).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_idle_session_times_out() {
        let addr = echo_server().await;
        let session = TcpConnector::new()
            .with_session_timeout(Duration::from_millis(50))
            .connect(&addr, Arc::new(CborCodec), Arc::new(|_: Response| {}))
            .await
            .unwrap();

        for _ in 0..100 {
            if session.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpConnector::new()
            .connect(&addr, Arc::new(CborCodec), Arc::new(|_: Response| {}))
            .await;
        assert!(matches!(result, Err(SessionError::Io(_))));
    }

    #[tokio::test]
    async fn test_peer_close_marks_session_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let session = TcpConnector::new()
            .connect(&addr, Arc::new(CborCodec), Arc::new(|_: Response| {}))
            .await
            .unwrap();

        for _ in 0..100 {
            if session.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.is_closed());
    }
}
