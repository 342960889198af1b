//! Module providing the validated configuration consumed by the client core.
//!
//! Configuration is supplied once, at construction time. Every field has a default so that partial
//! configuration files deserialize cleanly; [`Config::validate`] must pass before any component
//! opens a network connection.

use super::error::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_RECONNECT_BACKOFF_BASE_MS: u64 = 100;
pub const DEFAULT_RECONNECT_BACKOFF_CAP_MS: u64 = 30_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Broker addresses used for bootstrapping, `host:port`.
    pub brokers: Vec<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub reconnect_backoff_base_ms: u64,
    pub reconnect_backoff_cap_ms: u64,
    /// Number of connection attempts made before a request fails with `ConnectionLost`.
    pub reconnect_attempts: u32,
    pub metadata_refresh_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["127.0.0.1:9092".into()],
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            reconnect_backoff_base_ms: DEFAULT_RECONNECT_BACKOFF_BASE_MS,
            reconnect_backoff_cap_ms: DEFAULT_RECONNECT_BACKOFF_CAP_MS,
            reconnect_attempts: 5,
            metadata_refresh_interval_ms: 300_000,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn metadata_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.metadata_refresh_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub linger_ms: u64,
    pub max_batch_bytes: usize,
    /// Upper bound on bytes buffered or in flight for a single partition.
    pub max_pending_bytes: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// Upper bound on how long `publish` waits for buffer space.
    pub max_block_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            linger_ms: 5,
            max_batch_bytes: 16 * 1024,
            max_pending_bytes: 1024 * 1024,
            max_retries: 3,
            retry_backoff_ms: 100,
            retry_backoff_max_ms: 1_000,
            max_block_ms: 60_000,
        }
    }
}

impl ProducerConfig {
    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn max_block(&self) -> Duration {
        Duration::from_millis(self.max_block_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Offsets are committed by the polling loop after successful handler invocations.
    Auto,
    /// Offsets are committed only when the caller commits them.
    Manual,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub poll_timeout_ms: u64,
    pub fetch_max_bytes: usize,
    pub commit_mode: CommitMode,
    /// Auto commit cadence; `0` commits after every successful handler invocation.
    pub auto_commit_interval_ms: u64,
    pub max_redeliveries: u32,
    pub redelivery_delay_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
            fetch_max_bytes: 1024 * 1024,
            commit_mode: CommitMode::Auto,
            auto_commit_interval_ms: 0,
            max_redeliveries: 3,
            redelivery_delay_ms: 1_000,
        }
    }
}

impl ConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn auto_commit_interval(&self) -> Duration {
        Duration::from_millis(self.auto_commit_interval_ms)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
}

impl Config {
    pub fn with_brokers<I, S>(brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = Self::default();
        config.connection.brokers = brokers.into_iter().map(Into::into).collect();
        config
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|err| Error::config_invalid(format!("malformed config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let (connection, producer, consumer) = (&self.connection, &self.producer, &self.consumer);

        if connection.brokers.is_empty() {
            return Err(Error::config_invalid("broker list is empty"));
        }

        if let Some(broker) = connection.brokers.iter().find(|x| x.trim().is_empty()) {
            return Err(Error::config_invalid(format!(
                "blank broker address: {:?}",
                broker
            )));
        }

        if connection.connect_timeout_ms == 0 || connection.request_timeout_ms == 0 {
            return Err(Error::config_invalid(
                "connect and request timeouts must be non-zero",
            ));
        }

        if connection.reconnect_backoff_base_ms > connection.reconnect_backoff_cap_ms {
            return Err(Error::config_invalid(
                "reconnect backoff base exceeds backoff cap",
            ));
        }

        if connection.metadata_refresh_interval_ms == 0 {
            return Err(Error::config_invalid(
                "metadata_refresh_interval_ms must be non-zero",
            ));
        }

        if connection.reconnect_attempts == 0 {
            return Err(Error::config_invalid("reconnect_attempts must be non-zero"));
        }

        if producer.max_batch_bytes == 0 {
            return Err(Error::config_invalid("max_batch_bytes must be non-zero"));
        }

        if producer.max_batch_bytes > producer.max_pending_bytes {
            return Err(Error::config_invalid(format!(
                "max_batch_bytes ({}) exceeds max_pending_bytes ({})",
                producer.max_batch_bytes, producer.max_pending_bytes
            )));
        }

        if producer.retry_backoff_ms > producer.retry_backoff_max_ms {
            return Err(Error::config_invalid(
                "retry backoff exceeds maximum retry backoff",
            ));
        }

        if consumer.poll_timeout_ms == 0 {
            return Err(Error::config_invalid("poll timeout must be non-zero"));
        }

        if consumer.fetch_max_bytes == 0 {
            return Err(Error::config_invalid("fetch_max_bytes must be non-zero"));
        }

        Ok(())
    }
}
