//! Interfaces between the pool and the network session layer.

use crate::error::SessionError;
use crate::protocol::{Codec, Request, Response};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// One physical connection plus its encode/decode pipeline.
///
/// A closed session never becomes usable again.
#[async_trait]
pub trait Session: Debug + Send + Sync + 'static {
    /// Identifier of this session, unique within its connector.
    fn id(&self) -> u64;

    /// Encode and write `request`, failing if it is not written within
    /// `timeout`.
    async fn write(&self, request: &Request, timeout: Duration) -> Result<(), SessionError>;

    /// Whether the session has been closed locally or by the peer.
    fn is_closed(&self) -> bool;

    /// Close the session. Calling this more than once has no effect.
    async fn close(&self);
}

/// Receives decoded responses from a session's inbound task.
///
/// Implementations must not block; the caller is the session's reader.
pub trait ResponseHandler: Send + Sync + 'static {
    /// Route one decoded response.
    fn handle_response(&self, response: Response);
}

impl<F> ResponseHandler for F
where
    F: Fn(Response) + Send + Sync + 'static,
{
    fn handle_response(&self, response: Response) {
        self(response);
    }
}

/// Opens sessions to a destination address.
#[async_trait]
pub trait Connector: Debug + Send + Sync + 'static {
    /// Open a session to `addr` that encodes with `codec` and delivers every
    /// decoded response to `handler`.
    async fn connect(
        &self,
        addr: &str,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<Arc<dyn Session>, SessionError>;
}
