//! Client configuration and the per-protocol configuration registry.

use crate::error::{ConfigError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for a remoting client of one protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Maximum pooled connections per destination address.
    pub pool_size: usize,

    /// Idle lifetime of a pooled connection.
    #[serde(with = "humantime_serde")]
    pub pool_ttl: Duration,

    /// Deadline for establishing a connection or waiting for a free slot.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Sessions opened per pooled connection.
    pub connection_number: usize,

    /// Interval between heartbeat rounds.
    #[serde(with = "humantime_serde")]
    pub heartbeat_period: Duration,

    /// Timeout of a single heartbeat exchange.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Consecutive heartbeat failures before a connection is evicted.
    pub heartbeat_max_failures: u32,

    /// Idle lifetime of a session as enforced by transports.
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Callback worker count. Values of one or less disable the worker pool.
    pub gr_pool_size: usize,

    /// Capacity of each callback queue.
    pub queue_len: usize,

    /// Number of callback queues.
    pub queue_number: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool_size: 64,
            pool_ttl: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(3),
            connection_number: 1,
            heartbeat_period: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(3),
            heartbeat_max_failures: 2,
            session_timeout: Duration::from_secs(180),
            gr_pool_size: 200,
            queue_len: 64,
            queue_number: 10,
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

impl ClientConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(invalid("pool_size", "must be greater than zero"));
        }
        if self.pool_ttl.is_zero() {
            return Err(invalid("pool_ttl", "must be greater than zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect_timeout", "must be greater than zero"));
        }
        if self.connection_number == 0 {
            return Err(invalid("connection_number", "must be greater than zero"));
        }
        if self.heartbeat_period.is_zero() {
            return Err(invalid("heartbeat_period", "must be greater than zero"));
        }
        if self.heartbeat_timeout.is_zero() || self.heartbeat_timeout >= self.heartbeat_period {
            return Err(invalid(
                "heartbeat_timeout",
                format!(
                    "must be non-zero and shorter than heartbeat_period ({:?})",
                    self.heartbeat_period
                ),
            ));
        }
        if self.heartbeat_max_failures == 0 {
            return Err(invalid("heartbeat_max_failures", "must be greater than zero"));
        }
        if self.session_timeout < self.heartbeat_period {
            return Err(invalid(
                "session_timeout",
                "must not be shorter than heartbeat_period",
            ));
        }
        if self.gr_pool_size > 1 {
            if self.queue_len == 0 {
                return Err(invalid("queue_len", "must be greater than zero"));
            }
            if self.queue_number == 0 {
                return Err(invalid("queue_number", "must be greater than zero"));
            }
        }
        Ok(())
    }

    /// Worker pool sizing derived from this configuration.
    #[must_use]
    pub const fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            size: self.gr_pool_size,
            queue_len: self.queue_len,
            queue_number: self.queue_number,
        }
    }
}

/// Sizing of the callback worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Worker count; one or less means every callback gets its own task.
    pub size: usize,
    /// Capacity of each queue.
    pub queue_len: usize,
    /// Number of queues.
    pub queue_number: usize,
}

impl WorkerSettings {
    /// Whether dedicated workers should be started.
    #[must_use]
    pub const fn is_pooled(&self) -> bool {
        self.size > 1
    }
}

#[derive(Debug, Deserialize)]
struct ConsumerDocument {
    #[serde(default)]
    protocol_conf: Option<HashMap<String, ClientConfig>>,
}

/// Resolved client configuration per protocol.
///
/// Replacements are validated before they become visible; a rejected
/// replacement leaves the previous configuration in place.
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    protocols: RwLock<HashMap<String, Arc<ClientConfig>>>,
}

impl ConfigRegistry {
    /// Create an empty registry. Every protocol resolves to the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load protocol sections from a consumer YAML document.
    ///
    /// The document's `protocol_conf` mapping is keyed by protocol name.
    /// Fields omitted in a section keep their default value.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not parse or any section fails
    /// validation.
    pub fn from_yaml(document: &str) -> Result<Self> {
        let parsed: ConsumerDocument = serde_yaml::from_str(document).map_err(ConfigError::from)?;
        let registry = Self::new();

        match parsed.protocol_conf {
            Some(sections) => {
                for (protocol, config) in sections {
                    registry.set(&protocol, config)?;
                }
            }
            None => info!("protocol_conf not set, every protocol uses the default config"),
        }

        Ok(registry)
    }

    /// Replace the configuration of `protocol`.
    ///
    /// # Errors
    ///
    /// Returns an error, keeping the previous value, if `config` is invalid.
    pub fn set(&self, protocol: &str, config: ClientConfig) -> Result<()> {
        if let Err(e) = config.validate() {
            warn!("rejected client config for protocol {}: {}", protocol, e);
            return Err(e.into());
        }

        debug!("client config for protocol {} replaced", protocol);
        self.protocols
            .write()
            .insert(protocol.to_string(), Arc::new(config));
        Ok(())
    }

    /// Resolve the configuration for `protocol`, falling back to defaults.
    #[must_use]
    pub fn resolve(&self, protocol: &str) -> Arc<ClientConfig> {
        if let Some(config) = self.protocols.read().get(protocol) {
            return Arc::clone(config);
        }

        info!("no client config for protocol {}, using defaults", protocol);
        Arc::new(ClientConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.worker_settings().is_pooled());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ClientConfig::default();
        config.pool_size = 0;
        assert!(config.validate().is_err());

        config = ClientConfig::default();
        config.heartbeat_timeout = config.heartbeat_period;
        assert!(config.validate().is_err());

        config = ClientConfig::default();
        config.heartbeat_max_failures = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "heartbeat_max_failures",
                ..
            })
        ));

        config = ClientConfig::default();
        config.gr_pool_size = 1;
        config.queue_len = 0;
        assert!(config.validate().is_ok());

        config.gr_pool_size = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_section_overrides_defaults() {
        let doc = r#"
protocol_conf:
  dubbo:
    pool_size: 4
    pool_ttl: 60s
    heartbeat_period: 10s
"#;
        let registry = ConfigRegistry::from_yaml(doc).unwrap();
        let config = registry.resolve("dubbo");

        assert_eq!(config.pool_size, 4);
        assert_eq!(config.pool_ttl, Duration::from_secs(60));
        assert_eq!(config.heartbeat_period, Duration::from_secs(10));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));

        assert_eq!(*registry.resolve("grpc"), ClientConfig::default());
    }

    #[test]
    fn test_yaml_without_protocol_conf() {
        let registry = ConfigRegistry::from_yaml("application: demo\n").unwrap();
        assert_eq!(*registry.resolve("dubbo"), ClientConfig::default());
    }

    #[test]
    fn test_yaml_invalid_section_is_rejected() {
        let doc = "protocol_conf:\n  dubbo:\n    pool_size: 0\n";
        assert!(ConfigRegistry::from_yaml(doc).is_err());
    }

    #[test]
    fn test_rejected_replacement_keeps_previous() {
        let registry = ConfigRegistry::new();
        let good = ClientConfig {
            pool_size: 2,
            ..ClientConfig::default()
        };
        registry.set("dubbo", good.clone()).unwrap();

        let bad = ClientConfig {
            pool_size: 0,
            ..ClientConfig::default()
        };
        assert!(registry.set("dubbo", bad).is_err());
        assert_eq!(*registry.resolve("dubbo"), good);
    }
}
