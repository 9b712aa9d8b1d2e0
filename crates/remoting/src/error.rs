//! Error types for the remoting client.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for remoting operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for remoting operations.
///
/// Every variant names a distinct failure kind so callers can decide whether
/// to retry the call, fail it, or tear down the client.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid client configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No codec is registered for the protocol.
    #[error("Illegal codec type: {0}")]
    UnknownCodec(String),

    /// The destination address is missing or malformed.
    #[error("Remote address invalid or empty: {0}")]
    InvalidAddress(String),

    /// The request was rejected before dispatch.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A zero timeout was supplied for a call that must wait.
    #[error("Request timeout must be greater than zero")]
    InvalidTimeout,

    /// The client has not been connected, or was closed.
    #[error("Client is not connected")]
    NotConnected,

    /// The pool has been closed.
    #[error("Connection pool closed")]
    PoolClosed,

    /// No connection became available before the acquire deadline.
    #[error("No connection available for {addr} after {waited:?}")]
    PoolExhausted {
        /// Destination address.
        addr: String,
        /// How long the caller waited for a slot.
        waited: Duration,
    },

    /// The pooled connection had no open session to write to.
    #[error("Session not exist for {0}")]
    SessionNotExist(String),

    /// Establishing a new connection failed.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        /// Destination address.
        addr: String,
        /// The underlying error.
        #[source]
        source: SessionError,
    },

    /// Writing the request to the session failed.
    #[error("Failed to write request {request_id} to {addr}: {source}")]
    Write {
        /// Destination address.
        addr: String,
        /// Correlation id of the request.
        request_id: uuid::Uuid,
        /// The underlying error.
        #[source]
        source: SessionError,
    },

    /// No response arrived before the call timeout.
    #[error("Client read timeout after {0:?}")]
    ReadTimeout(Duration),

    /// The peer answered with an error.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Encoding or decoding failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// The response slot was dropped without being resolved.
    #[error("Response channel closed")]
    ChannelClosed,
}

/// Errors raised by a session implementation.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session is closed.
    #[error("Session closed")]
    Closed,

    /// The write did not complete in time.
    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Connecting did not complete in time.
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Frame could not be encoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),
}

impl From<ciborium::de::Error<io::Error>> for CodecError {
    fn from(err: ciborium::de::Error<io::Error>) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for CodecError {
    fn from(err: ciborium::ser::Error<io::Error>) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range.
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// The configuration document could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
