//! Request and response messages exchanged with a peer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation id pairing a response with its request.
pub type RequestId = Uuid;

/// Protocol version stamped on requests built by this crate.
pub const PROTOCOL_VERSION: &str = "2.0.2";

/// A logical remote call.
///
/// A request is immutable once handed to the client; sessions only borrow it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Unique correlation id.
    pub id: RequestId,
    /// Protocol version.
    pub version: String,
    /// Whether the peer is expected to answer.
    pub two_way: bool,
    /// Control message (heartbeat) rather than a service call.
    pub event: bool,
    /// Opaque encoded invocation.
    pub payload: Bytes,
}

impl Request {
    /// A call that expects a response.
    #[must_use]
    pub fn two_way(payload: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: PROTOCOL_VERSION.to_string(),
            two_way: true,
            event: false,
            payload: payload.into(),
        }
    }

    /// A fire-and-forget call.
    #[must_use]
    pub fn one_way(payload: impl Into<Bytes>) -> Self {
        Self {
            two_way: false,
            ..Self::two_way(payload)
        }
    }

    /// An empty two-way control request used to probe liveness.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self {
            event: true,
            ..Self::two_way(Bytes::new())
        }
    }

    /// Whether this is a heartbeat probe.
    #[must_use]
    pub const fn is_heartbeat(&self) -> bool {
        self.event && self.two_way
    }
}

/// A decoded answer from the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this answers.
    pub id: RequestId,
    /// Protocol version.
    pub version: String,
    /// Answer to a control message.
    pub event: bool,
    /// Opaque encoded result.
    pub payload: Bytes,
    /// Error reported by the peer, if the call failed remotely.
    pub error: Option<String>,
}

impl Response {
    /// A successful response.
    #[must_use]
    pub fn ok(id: RequestId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            version: PROTOCOL_VERSION.to_string(),
            event: false,
            payload: payload.into(),
            error: None,
        }
    }

    /// A failed response.
    #[must_use]
    pub fn error(id: RequestId, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::ok(id, Bytes::new())
        }
    }

    /// The answer to a heartbeat probe.
    #[must_use]
    pub fn heartbeat(id: RequestId) -> Self {
        Self {
            event: true,
            ..Self::ok(id, Bytes::new())
        }
    }

    /// Answer `request` by echoing its payload, keeping the event flag.
    #[must_use]
    pub fn echo(request: &Request) -> Self {
        Self {
            event: request.event,
            ..Self::ok(request.id, request.payload.clone())
        }
    }
}
