//! Transport layer of the client.
//!
//! Sessions are the physical links, opened by a [`Connector`]. A
//! [`PooledConnection`] groups one or more sessions to the same address and
//! the [`ConnectionPool`] loans connections out to calls.

pub mod connection;
pub mod pool;
pub mod selector;
pub mod session;
pub mod tcp;

pub use connection::{PooledConnection, SessionLease, SessionSlot};
pub use pool::{ConnectionPool, PoolSettings, PoolStats};
pub use selector::{LeastPending, RoundRobin, SelectionStrategy, SessionSelector};
pub use session::{Connector, ResponseHandler, Session};
pub use tcp::{TcpConnector, TcpSession};
