//! Helpers shared by the integration tests.

#![allow(dead_code)]

use proven_remoting::{Client, ClientConfig, ConfigRegistry, Url};
use proven_remoting_memory::{MemoryConnector, MemoryPeer};
use std::sync::Arc;
use std::time::Duration;

pub const ADDR: &str = "127.0.0.1:20000";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn url() -> Url {
    Url::parse(&format!("dubbo://{ADDR}")).unwrap()
}

/// Registry holding `config` for the `dubbo` protocol.
pub fn registry(config: ClientConfig) -> Arc<ConfigRegistry> {
    let registry = ConfigRegistry::new();
    registry.set("dubbo", config).unwrap();
    Arc::new(registry)
}

pub fn small_pool() -> ClientConfig {
    ClientConfig {
        pool_size: 2,
        pool_ttl: Duration::from_secs(60),
        ..ClientConfig::default()
    }
}

/// A client connected to `peer` through in-memory sessions.
pub async fn connected(peer: &Arc<MemoryPeer>, config: ClientConfig) -> Client {
    init_tracing();
    let client = Client::builder()
        .connector(MemoryConnector::new(Arc::clone(peer)))
        .configs(registry(config))
        .build();
    client.connect(&url()).await.unwrap();
    client
}

/// Let spawned tasks run until `condition` holds or a second passes.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
