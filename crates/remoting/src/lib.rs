//! Client-side transport core of an RPC framework.
//!
//! A [`Client`] turns a logical remote call into a correlated request and
//! response exchange over a pool of long-lived, multiplexed connections.
//!
//! # Features
//!
//! - **Connection pooling**: bounded per destination, with idle TTL expiry
//! - **Correlation**: every two-way call resolves exactly once, by its
//!   response or its timeout
//! - **Heartbeats**: idle connections are probed and evicted when dead
//! - **Pluggable sessions and codecs**: TCP and CBOR out of the box
//!
//! # Example
//!
//! ```no_run
//! use proven_remoting::{Client, Request, Url};
//! use std::time::Duration;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder().build();
//!     client.connect(&Url::parse("dubbo://127.0.0.1:20000")?).await?;
//!
//!     let response = client
//!         .request(Request::two_way("ping"), Duration::from_secs(5), None)
//!         .await?;
//!     println!("{:?}", response.map(|r| r.payload));
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod pending;
pub mod protocol;
pub mod transport;
pub mod worker;

pub use client::{Client, ClientBuilder, Options};
pub use config::{ClientConfig, ConfigRegistry, WorkerSettings};
pub use error::{CodecError, ConfigError, Error, Result, SessionError};
pub use heartbeat::{HeartbeatMonitor, HeartbeatReport, heartbeat};
pub use pending::{
    AsyncCallback, CallTiming, CallbackResponse, OwnerId, PendingResponse, PendingResponses,
};
pub use protocol::{CborCodec, Codec, CodecRegistry, Request, RequestId, Response};
pub use transport::{
    ConnectionPool, Connector, PoolSettings, PoolStats, PooledConnection, ResponseHandler,
    SelectionStrategy, Session, TcpConnector,
};
pub use worker::TaskPool;

pub use bytes::Bytes;
pub use url::Url;
