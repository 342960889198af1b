//! Module providing the connection manager: long-lived sessions to broker nodes, metadata
//! discovery and reconnection.
//!
//! The manager keeps at most one [`BrokerConnection`] per broker address, opened lazily on first
//! use. Lost connections are re-established on the next request with exponential backoff and
//! full jitter. Cluster metadata is refreshed periodically by a background task and on demand
//! whenever a broker reports stale metadata.

use super::{
    common::backoff::Backoff,
    config::ConnectionConfig,
    error::{Error, ErrorKind, Result},
    protocol::{unexpected_response, Request, Response, TopicPartition},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

pub mod broker_connection;
pub mod metadata;
pub mod tcp;

pub use broker_connection::BrokerConnection;
pub use metadata::ClusterMetadata;

/// Opens byte streams to broker addresses.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self, address: &str) -> std::io::Result<Self::Stream>;
}

type ConnectionSlot = Arc<tokio::sync::Mutex<Option<Arc<BrokerConnection>>>>;

pub struct ConnectionManager<C: Connector> {
    connector: C,
    config: ConnectionConfig,
    backoff: Backoff,

    slots: Mutex<HashMap<String, ConnectionSlot>>,
    metadata: RwLock<ClusterMetadata>,
    refresh_lock: tokio::sync::Mutex<()>,

    correlation_ids: AtomicU64,
    closed: AtomicBool,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Connects to the cluster: performs the initial metadata discovery against the bootstrap
    /// brokers and starts the periodic metadata refresh task.
    #[instrument(skip_all, fields(brokers = ?config.brokers))]
    pub async fn connect(connector: C, config: ConnectionConfig) -> Result<Arc<Self>> {
        if config.brokers.is_empty() {
            return Err(Error::config_invalid("broker list is empty"));
        }

        let backoff = Backoff::new(
            Duration::from_millis(config.reconnect_backoff_base_ms),
            Duration::from_millis(config.reconnect_backoff_cap_ms),
        );

        let manager = Arc::new(Self {
            connector,
            config,
            backoff,
            slots: Mutex::new(HashMap::new()),
            metadata: RwLock::new(ClusterMetadata::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            correlation_ids: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            refresh_task: Mutex::new(None),
        });

        manager.refresh_metadata(&[]).await?;

        let refresh_task = tokio::spawn(
            Self::refresh_periodically(
                Arc::downgrade(&manager),
                manager.config.metadata_refresh_interval(),
            )
            .instrument(info_span!("metadata_refresh_task")),
        );

        if let Ok(mut task) = manager.refresh_task.lock() {
            *task = Some(refresh_task);
        }

        info!("connected to cluster");

        Ok(manager)
    }

    async fn refresh_periodically(weak_manager: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(manager) = weak_manager.upgrade() else {
                break;
            };

            if manager.is_closed() {
                break;
            }

            if let Err(err) = manager.refresh_metadata(&[]).await {
                warn!(error = %err, "periodic metadata refresh failed");
            }
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns a snapshot of the current cluster metadata.
    pub fn metadata(&self) -> ClusterMetadata {
        self.metadata
            .read()
            .map(|x| x.clone())
            .unwrap_or_default()
    }

    fn next_correlation_id(&self) -> u64 {
        self.correlation_ids.fetch_add(1, Ordering::Relaxed)
    }

    fn slot(&self, address: &str) -> Result<ConnectionSlot> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| Error::connection_lost("connection table poisoned"))?;

        Ok(slots
            .entry(address.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone())
    }

    /// Returns a live connection to `address`, opening or re-opening it if needed.
    async fn connection(&self, address: &str) -> Result<Arc<BrokerConnection>> {
        if self.is_closed() {
            return Err(Error::stopped("connection manager is closed"));
        }

        let slot = self.slot(address)?;
        let mut slot = slot.lock().await;

        if let Some(connection) = slot.as_ref().filter(|x| x.is_alive()) {
            return Ok(connection.clone());
        }

        let reconnect = slot.is_some();

        for attempt in 0..self.config.reconnect_attempts {
            if self.is_closed() {
                return Err(Error::stopped("connection manager is closed"));
            }

            let result =
                tokio::time::timeout(self.config.connect_timeout(), self.connector.connect(address))
                    .await;

            let err = match result {
                Ok(Ok(stream)) => {
                    let connection = Arc::new(BrokerConnection::spawn(address, stream));
                    *slot = Some(connection.clone());

                    if reconnect {
                        info!(address, attempt, "reconnected to broker");
                    } else {
                        debug!(address, "connected to broker");
                    }

                    return Ok(connection);
                }
                Ok(Err(err)) => Error::from(err),
                Err(_) => Error::timed_out(format!(
                    "connect to {} exceeded {:?}",
                    address,
                    self.config.connect_timeout()
                )),
            };

            if attempt + 1 < self.config.reconnect_attempts {
                let delay = self.backoff.delay(attempt);
                warn!(address, attempt, ?delay, error = %err, "connect failed, backing off");
                tokio::time::sleep(delay).await;
            } else {
                warn!(address, attempt, error = %err, "connect failed, giving up");
            }
        }

        Err(Error::connection_lost(format!(
            "unable to connect to {} after {} attempts",
            address, self.config.reconnect_attempts
        )))
    }

    /// Sends opaque request bytes to the broker at `address` and returns the response bytes.
    pub async fn send(&self, address: &str, payload: Bytes) -> Result<Bytes> {
        let connection = self.connection(address).await?;

        connection
            .round_trip(
                self.next_correlation_id(),
                payload,
                self.config.request_timeout(),
            )
            .await
    }

    /// Sends a request to the broker at `address`. Error responses are converted into errors of
    /// the corresponding kind.
    pub async fn request(&self, address: &str, request: &Request) -> Result<Response> {
        let response_bytes = self.send(address, request.encode()?).await?;
        Response::decode(&response_bytes)?.into_result()
    }

    /// Sends a request to the leader of `topic_partition`. A `StaleMetadata` failure schedules
    /// a metadata refresh before being returned to the caller for retry.
    pub async fn request_leader(
        &self,
        topic_partition: &TopicPartition,
        request: &Request,
    ) -> Result<Response> {
        let address = match self.leader_address(topic_partition) {
            Some(address) => address,
            None => {
                self.refresh_metadata(&[topic_partition.topic.clone()])
                    .await?;

                self.leader_address(topic_partition).ok_or_else(|| {
                    Error::new(
                        ErrorKind::StaleMetadata,
                        format!("no leader known for {}", topic_partition),
                    )
                })?
            }
        };

        let result = self.request(&address, request).await;

        if let Err(err) = &result {
            if err.kind() == ErrorKind::StaleMetadata {
                debug!(%topic_partition, "stale metadata reported, refreshing");

                if let Err(refresh_err) = self
                    .refresh_metadata(&[topic_partition.topic.clone()])
                    .await
                {
                    warn!(error = %refresh_err, "metadata refresh failed");
                }
            }
        }

        result
    }

    /// Sends a request to the consumer group coordinator.
    pub async fn request_coordinator(&self, request: &Request) -> Result<Response> {
        let address = self
            .metadata
            .read()
            .ok()
            .and_then(|x| x.coordinator_address().map(|x| x.to_owned()))
            .or_else(|| self.config.brokers.first().cloned())
            .ok_or_else(|| Error::config_invalid("broker list is empty"))?;

        self.request(&address, request).await
    }

    fn leader_address(&self, topic_partition: &TopicPartition) -> Option<String> {
        self.metadata
            .read()
            .ok()?
            .leader_address(topic_partition)
            .map(|x| x.to_owned())
    }

    /// Number of partitions of `topic`, refreshing metadata once if the topic is unknown.
    pub async fn partition_count(&self, topic: &str) -> Result<u32> {
        let known = self
            .metadata
            .read()
            .ok()
            .and_then(|x| x.partition_count(topic));

        if let Some(count) = known {
            return Ok(count);
        }

        self.refresh_metadata(&[topic.to_owned()]).await?;

        self.metadata
            .read()
            .ok()
            .and_then(|x| x.partition_count(topic))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::StaleMetadata,
                    format!("unknown topic: {}", topic),
                )
            })
    }

    /// Fetches metadata for `topics` (all topics when empty) from the first reachable broker,
    /// trying known brokers before the bootstrap list.
    #[instrument(skip(self))]
    pub async fn refresh_metadata(&self, topics: &[String]) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;

        let mut candidates = self.metadata().broker_addresses();
        for broker in &self.config.brokers {
            if !candidates.contains(broker) {
                candidates.push(broker.clone());
            }
        }

        let request = Request::Metadata {
            topics: topics.to_vec(),
        };

        let mut last_err = Error::connection_lost("no brokers reachable");

        for address in candidates {
            match self.request(&address, &request).await {
                Ok(Response::Metadata { brokers, topics }) => {
                    debug!(
                        address,
                        brokers = brokers.len(),
                        topics = topics.len(),
                        "metadata refreshed"
                    );

                    self.metadata
                        .write()
                        .map_err(|_| Error::protocol("metadata lock poisoned"))?
                        .update(brokers, topics);

                    return Ok(());
                }
                Ok(response) => return Err(unexpected_response(request.name(), &response)),
                Err(err) if err.kind() == ErrorKind::Stopped => return Err(err),
                Err(err) => {
                    warn!(address, error = %err, "metadata request failed");
                    last_err = err;
                }
            }
        }

        Err(last_err)
    }

    /// Closes every connection and stops the metadata refresh task. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(task) = self.refresh_task.lock().ok().and_then(|mut x| x.take()) {
            task.abort();
        }

        let slots: Vec<_> = self
            .slots
            .lock()
            .map(|mut x| x.drain().map(|(_, slot)| slot).collect())
            .unwrap_or_default();

        for slot in slots {
            if let Ok(slot) = slot.try_lock() {
                if let Some(connection) = slot.as_ref() {
                    connection.close();
                }
            }
        }

        info!("connection manager closed");
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.get_mut().ok().and_then(|x| x.take()) {
            task.abort();
        }
    }
}
