//! Liveness probing of idle pooled connections.

use crate::client::transfer;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::pending::{OwnerId, PendingResponses};
use crate::protocol::Request;
use crate::transport::{ConnectionPool, PooledConnection, Session};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Send one heartbeat over `session` and wait for the peer to answer.
///
/// The probe goes through the same write and wait path as a regular
/// two-way call.
///
/// # Errors
///
/// Returns [`Error::Write`] if the probe could not be written and
/// [`Error::ReadTimeout`] if no answer arrived within `timeout`.
pub async fn heartbeat(
    addr: &str,
    session: &dyn Session,
    pending: &PendingResponses,
    timeout: Duration,
) -> Result<()> {
    let request = Request::heartbeat();
    let waiting = pending.register(OwnerId::NONE, request.id);

    if let Err(e) = transfer(addr, session, &request, timeout, Some(waiting.timing())).await {
        pending.discard(&request.id);
        return Err(e);
    }

    match pending.wait(waiting, timeout).await {
        // Any answer proves the peer is alive.
        Ok(_) | Err(Error::Remote(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Outcome of one heartbeat round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Connections probed.
    pub probed: usize,
    /// Probes that failed.
    pub failed: usize,
    /// Connections evicted from the pool.
    pub evicted: usize,
}

enum Probe {
    Alive,
    Failed,
    Evicted,
}

/// Periodically probes every idle connection of a pool.
///
/// A connection whose probe cannot be written is evicted at once. Probes
/// that time out are counted, and the connection is evicted after
/// `heartbeat_max_failures` consecutive misses.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    pool: ConnectionPool,
    pending: Arc<PendingResponses>,
    period: Duration,
    timeout: Duration,
    max_failures: u32,
}

impl HeartbeatMonitor {
    /// Create a monitor for `pool` using the heartbeat settings of `config`.
    #[must_use]
    pub fn new(pool: ConnectionPool, pending: Arc<PendingResponses>, config: &ClientConfig) -> Self {
        Self {
            pool,
            pending,
            period: config.heartbeat_period,
            timeout: config.heartbeat_timeout,
            max_failures: config.heartbeat_max_failures,
        }
    }

    /// Run heartbeat rounds every period until the pool closes.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let shutdown = self.pool.shutdown_token();
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.run_once().await;
                        if report.evicted > 0 {
                            info!(
                                "heartbeat evicted {} of {} connections",
                                report.evicted, report.probed
                            );
                        }
                    }
                    () = shutdown.cancelled() => break,
                }
            }

            debug!("heartbeat monitor stopped");
        })
    }

    /// Probe every idle connection once.
    pub async fn run_once(&self) -> HeartbeatReport {
        let connections = self.pool.idle_connections();
        let outcomes = join_all(connections.iter().map(|conn| self.probe(conn))).await;

        let mut report = HeartbeatReport {
            probed: outcomes.len(),
            ..HeartbeatReport::default()
        };
        for outcome in outcomes {
            match outcome {
                Probe::Alive => {}
                Probe::Failed => report.failed += 1,
                Probe::Evicted => {
                    report.failed += 1;
                    report.evicted += 1;
                }
            }
        }
        report
    }

    async fn probe(&self, conn: &Arc<PooledConnection>) -> Probe {
        let Some(session) = conn.select_session() else {
            warn!("connection {} to {} has no open session", conn.id(), conn.addr());
            self.pool.remove(conn).await;
            return Probe::Evicted;
        };

        let outcome = heartbeat(conn.addr(), &*session, &self.pending, self.timeout).await;
        drop(session);

        match outcome {
            Ok(()) => {
                conn.reset_heartbeat_failures();
                Probe::Alive
            }
            Err(Error::ReadTimeout(_)) => {
                let failures = conn.record_heartbeat_failure();
                if failures >= self.max_failures {
                    warn!(
                        "connection {} to {} missed {} heartbeats, evicting",
                        conn.id(),
                        conn.addr(),
                        failures
                    );
                    self.pool.remove(conn).await;
                    Probe::Evicted
                } else {
                    debug!(
                        "connection {} to {} missed heartbeat ({}/{})",
                        conn.id(),
                        conn.addr(),
                        failures,
                        self.max_failures
                    );
                    Probe::Failed
                }
            }
            Err(e) => {
                warn!("heartbeat to {} failed, evicting connection {}: {}", conn.addr(), conn.id(), e);
                self.pool.remove(conn).await;
                Probe::Evicted
            }
        }
    }
}
