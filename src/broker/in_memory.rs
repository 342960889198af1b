//! Module providing an in-process broker served over [`tokio::io::duplex`] streams.
//!
//! The broker keeps every partition as an in-memory vector of records and serves the full
//! request set understood by the client. It supports fault injection (error responses, lost
//! responses, paused appends, unreachable broker) so that the client's recovery paths can be
//! exercised deterministically.

use super::super::{
    connection::Connector,
    protocol::{
        frame::{read_frame, write_frame, Frame},
        BrokerNode, ErrorCode, NodeId, PartitionMetadata, ProducedRecord, Request, Response,
        StoredRecord, TopicMetadata, TopicPartition,
    },
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{
    io::DuplexStream,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error_span, Instrument};

pub const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub node_id: NodeId,
    pub address: String,
    /// Partition count for topics created on first metadata lookup.
    pub default_partitions: u32,
    pub auto_create_topics: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            address: "loopback:9092".into(),
            default_partitions: 4,
            auto_create_topics: true,
        }
    }
}

#[derive(Default)]
struct PartitionLog {
    records: Vec<StoredRecord>,
    /// producer id -> (last base sequence, base offset assigned to it)
    sequences: HashMap<u64, (u64, u64)>,
}

impl PartitionLog {
    fn append(
        &mut self,
        producer_id: u64,
        base_sequence: u64,
        records: Vec<ProducedRecord>,
    ) -> (u64, bool) {
        if let Some((last_sequence, base_offset)) = self.sequences.get(&producer_id) {
            if *last_sequence == base_sequence {
                return (*base_offset, true);
            }
        }

        let base_offset = self.records.len() as u64;

        for (i, record) in records.into_iter().enumerate() {
            self.records.push(StoredRecord {
                offset: base_offset + i as u64,
                key: record.key,
                payload: record.payload,
                timestamp_ms: record.timestamp_ms,
            });
        }

        self.sequences
            .insert(producer_id, (base_sequence, base_offset));

        (base_offset, false)
    }

    fn read(&self, offset: u64, max_bytes: u64) -> Vec<StoredRecord> {
        let mut bytes = 0;
        let mut records = Vec::new();

        for record in self.records.iter().skip(offset as usize) {
            bytes += record.size() as u64;

            if !records.is_empty() && bytes > max_bytes {
                break;
            }

            records.push(record.clone());
        }

        records
    }
}

#[derive(Default)]
struct Faults {
    produce_errors: VecDeque<ErrorCode>,
    lost_produce_responses: usize,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<PartitionLog>>,
    group_offsets: HashMap<(String, TopicPartition), u64>,
    faults: Faults,
}

pub struct InMemoryBroker {
    config: BrokerConfig,
    state: Mutex<State>,

    appended: watch::Sender<u64>,
    produce_paused: watch::Sender<bool>,
    metadata_paused: watch::Sender<bool>,

    reachable: AtomicBool,
    connection_attempts: AtomicUsize,
    metadata_requests: AtomicUsize,
    produce_requests: AtomicUsize,

    connections: Mutex<Vec<JoinHandle<()>>>,
}

impl InMemoryBroker {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(State::default()),
            appended: watch::channel(0).0,
            produce_paused: watch::channel(false).0,
            metadata_paused: watch::channel(false).0,
            reachable: AtomicBool::new(true),
            connection_attempts: AtomicUsize::new(0),
            metadata_requests: AtomicUsize::new(0),
            produce_requests: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn create_topic(&self, topic: &str, partitions: u32) {
        self.state()
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| (0..partitions).map(|_| PartitionLog::default()).collect());
    }

    /// Appends records directly, bypassing the request path.
    pub fn append(&self, topic_partition: &TopicPartition, payloads: &[&[u8]]) -> Option<u64> {
        let mut state = self.state();
        let log = state
            .topics
            .get_mut(&topic_partition.topic)?
            .get_mut(topic_partition.partition as usize)?;

        let base_offset = log.records.len() as u64;

        for (i, payload) in payloads.iter().enumerate() {
            log.records.push(StoredRecord {
                offset: base_offset + i as u64,
                key: None,
                payload: payload.to_vec().into(),
                timestamp_ms: 0,
            });
        }

        drop(state);
        self.appended.send_modify(|x| *x += 1);

        Some(base_offset)
    }

    pub fn records(&self, topic_partition: &TopicPartition) -> Vec<StoredRecord> {
        self.state()
            .topics
            .get(&topic_partition.topic)
            .and_then(|x| x.get(topic_partition.partition as usize))
            .map(|x| x.records.clone())
            .unwrap_or_default()
    }

    pub fn partition_len(&self, topic_partition: &TopicPartition) -> usize {
        self.records(topic_partition).len()
    }

    pub fn committed_offset(&self, group_id: &str, topic_partition: &TopicPartition) -> Option<u64> {
        self.state()
            .group_offsets
            .get(&(group_id.to_owned(), topic_partition.clone()))
            .copied()
    }

    /// Responds to the next `count` produce requests with `code` without appending.
    pub fn fail_next_produces(&self, count: usize, code: ErrorCode) {
        self.state()
            .faults
            .produce_errors
            .extend(std::iter::repeat(code).take(count));
    }

    /// Appends the next `count` produce requests but hangs up instead of responding.
    pub fn lose_next_produce_responses(&self, count: usize) {
        self.state().faults.lost_produce_responses += count;
    }

    /// Holds produce requests until [`InMemoryBroker::resume_produces`] is called.
    pub fn pause_produces(&self) {
        self.produce_paused.send_replace(true);
    }

    pub fn resume_produces(&self) {
        self.produce_paused.send_replace(false);
    }

    /// Holds metadata requests until [`InMemoryBroker::resume_metadata`] is called.
    pub fn pause_metadata(&self) {
        self.metadata_paused.send_replace(true);
    }

    pub fn resume_metadata(&self) {
        self.metadata_paused.send_replace(false);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    /// Hangs up every open connection.
    pub fn drop_connections(&self) {
        let connections = match self.connections.lock() {
            Ok(mut connections) => std::mem::take(&mut *connections),
            Err(_) => Vec::new(),
        };

        for connection in connections {
            connection.abort();
        }
    }

    pub fn connection_attempts(&self) -> usize {
        self.connection_attempts.load(Ordering::Acquire)
    }

    pub fn metadata_requests(&self) -> usize {
        self.metadata_requests.load(Ordering::Acquire)
    }

    pub fn produce_requests(&self) -> usize {
        self.produce_requests.load(Ordering::Acquire)
    }

    async fn metadata(&self, topics: Vec<String>) -> Response {
        self.metadata_requests.fetch_add(1, Ordering::AcqRel);

        wait_while_paused(&self.metadata_paused).await;

        let mut state = self.state();

        if self.config.auto_create_topics {
            for topic in &topics {
                state.topics.entry(topic.clone()).or_insert_with(|| {
                    (0..self.config.default_partitions)
                        .map(|_| PartitionLog::default())
                        .collect()
                });
            }
        }

        let topics = state
            .topics
            .iter()
            .filter(|(name, _)| topics.is_empty() || topics.contains(name))
            .map(|(name, partitions)| TopicMetadata {
                topic: name.clone(),
                partitions: (0..partitions.len() as u32)
                    .map(|partition| PartitionMetadata {
                        partition,
                        leader: self.config.node_id,
                    })
                    .collect(),
            })
            .collect();

        Response::Metadata {
            brokers: vec![BrokerNode {
                id: self.config.node_id,
                address: self.config.address.clone(),
            }],
            topics,
        }
    }

    /// Returns `None` when the response is to be lost.
    async fn produce(
        &self,
        topic_partition: TopicPartition,
        producer_id: u64,
        base_sequence: u64,
        records: Vec<ProducedRecord>,
    ) -> Option<Response> {
        self.produce_requests.fetch_add(1, Ordering::AcqRel);

        wait_while_paused(&self.produce_paused).await;

        let mut state = self.state();

        if let Some(code) = state.faults.produce_errors.pop_front() {
            return Some(Response::error(code, "injected produce failure"));
        }

        let log = match state
            .topics
            .get_mut(&topic_partition.topic)
            .and_then(|x| x.get_mut(topic_partition.partition as usize))
        {
            Some(log) => log,
            None => {
                return Some(Response::error(
                    ErrorCode::UnknownTopicOrPartition,
                    topic_partition.to_string(),
                ))
            }
        };

        let (base_offset, duplicate) = log.append(producer_id, base_sequence, records);

        if duplicate {
            debug!(%topic_partition, base_sequence, "duplicate batch acknowledged");
        }

        let lose_response = state.faults.lost_produce_responses > 0;
        if lose_response {
            state.faults.lost_produce_responses -= 1;
        }

        drop(state);
        self.appended.send_modify(|x| *x += 1);

        (!lose_response).then_some(Response::Produced { base_offset })
    }

    async fn fetch(
        &self,
        topic_partition: TopicPartition,
        offset: u64,
        max_bytes: u64,
        max_wait: Duration,
    ) -> Response {
        let mut appended = self.appended.subscribe();
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let (records, high_watermark) = {
                let state = self.state();

                match state
                    .topics
                    .get(&topic_partition.topic)
                    .and_then(|x| x.get(topic_partition.partition as usize))
                {
                    Some(log) => (log.read(offset, max_bytes), log.records.len() as u64),
                    None => {
                        return Response::error(
                            ErrorCode::UnknownTopicOrPartition,
                            topic_partition.to_string(),
                        )
                    }
                }
            };

            if !records.is_empty() {
                return Response::Fetched {
                    records,
                    high_watermark,
                };
            }

            match tokio::time::timeout_at(deadline, appended.changed()).await {
                Ok(Ok(_)) => continue,
                _ => {
                    return Response::Fetched {
                        records,
                        high_watermark,
                    }
                }
            }
        }
    }

    fn offset_commit(&self, group_id: String, offsets: Vec<(TopicPartition, u64)>) -> Response {
        let mut state = self.state();

        for (topic_partition, offset) in offsets {
            state
                .group_offsets
                .insert((group_id.clone(), topic_partition), offset);
        }

        Response::OffsetCommitted
    }

    fn offset_fetch(&self, group_id: String, partitions: Vec<TopicPartition>) -> Response {
        let state = self.state();

        Response::OffsetFetched {
            offsets: partitions
                .into_iter()
                .map(|x| {
                    let offset = state.group_offsets.get(&(group_id.clone(), x.clone())).copied();
                    (x, offset)
                })
                .collect(),
        }
    }

    pub async fn handle_request(&self, request: Request) -> Option<Response> {
        match request {
            Request::Metadata { topics } => Some(self.metadata(topics).await),
            Request::Produce {
                topic_partition,
                producer_id,
                base_sequence,
                records,
            } => {
                self.produce(topic_partition, producer_id, base_sequence, records)
                    .await
            }
            Request::Fetch {
                topic_partition,
                offset,
                max_bytes,
                max_wait_ms,
            } => Some(
                self.fetch(
                    topic_partition,
                    offset,
                    max_bytes,
                    Duration::from_millis(max_wait_ms),
                )
                .await,
            ),
            Request::OffsetCommit { group_id, offsets } => {
                Some(self.offset_commit(group_id, offsets))
            }
            Request::OffsetFetch {
                group_id,
                partitions,
            } => Some(self.offset_fetch(group_id, partitions)),
        }
    }

    async fn handle_frame(self: Arc<Self>, frame: Frame) -> Option<Frame> {
        let response = match Request::decode(&frame.payload) {
            Ok(request) => self.handle_request(request).await?,
            Err(err) => Response::error(ErrorCode::CorruptMessage, err.to_string()),
        };

        match response.encode() {
            Ok(payload) => Some(Frame::new(frame.correlation_id, payload)),
            Err(_) => None,
        }
    }

    /// Serves requests arriving on `stream` until the peer hangs up. Each request is handled on
    /// its own task so that a parked fetch does not hold up other requests.
    pub async fn serve_connection(self: Arc<Self>, stream: DuplexStream) {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (response_tx, mut response_rx) = mpsc::unbounded_channel::<Option<Frame>>();

        let read_requests = async move {
            while let Ok(Some(frame)) = read_frame(&mut reader).await {
                let (broker, response_tx) = (self.clone(), response_tx.clone());

                tokio::spawn(async move {
                    let _ = response_tx.send(broker.handle_frame(frame).await);
                });
            }
        };

        let write_responses = async move {
            // a `None` response hangs up the connection
            while let Some(Some(frame)) = response_rx.recv().await {
                if write_frame(&mut writer, &frame).await.is_err() {
                    break;
                }
            }
        };

        tokio::select! {
            _ = read_requests => {},
            _ = write_responses => {},
        }
    }
}

async fn wait_while_paused(paused: &watch::Sender<bool>) {
    let mut paused = paused.subscribe();

    while *paused.borrow_and_update() {
        if paused.changed().await.is_err() {
            break;
        }
    }
}

/// [`Connector`] handing out duplex streams served by an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryConnector {
    broker: Arc<InMemoryBroker>,
}

impl InMemoryConnector {
    pub fn new(broker: Arc<InMemoryBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    type Stream = DuplexStream;

    async fn connect(&self, address: &str) -> std::io::Result<Self::Stream> {
        self.broker
            .connection_attempts
            .fetch_add(1, Ordering::AcqRel);

        if !self.broker.reachable.load(Ordering::Acquire) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{} unreachable", address),
            ));
        }

        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER_SIZE);

        let connection = tokio::spawn(
            self.broker
                .clone()
                .serve_connection(server)
                .instrument(error_span!("in_memory_broker_connection", address)),
        );

        if let Ok(mut connections) = self.broker.connections.lock() {
            connections.retain(|x| !x.is_finished());
            connections.push(connection);
        }

        Ok(client)
    }
}
