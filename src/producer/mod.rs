//! Module providing the producer core: batching, partition assignment, acknowledgement tracking
//! and retries.
//!
//! Every published record is owned by the producer until its [`DeliveryFuture`] resolves, either
//! with the [`Ack`] carrying its offset, or with a `DeliveryFailed` error once retries are
//! exhausted. A single sender task turns ready partition buffers into batches; each batch is
//! dispatched on its own task and retried as a whole on transient failures.

use super::{
    common::backoff::Backoff,
    config::ProducerConfig,
    connection::{ConnectionManager, Connector},
    error::{Error, ErrorKind, Result},
    protocol::{unexpected_response, Request, Response, TopicPartition},
    record::Record,
};
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    sync::{oneshot, watch, Notify},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

pub mod accumulator;
pub mod partitioner;

use accumulator::{Accumulator, Appended, Batch, PendingRecord, Rejected};
use partitioner::{DefaultPartitioner, Partitioner};

/// Sleep used by the sender task when no linger deadline is pending.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Acknowledgement for a published record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ack {
    pub topic_partition: TopicPartition,
    pub offset: u64,
}

/// Resolves once the broker acknowledged the record or delivery failed permanently.
#[derive(Debug)]
pub struct DeliveryFuture {
    ack_rx: oneshot::Receiver<Result<Ack>>,
}

impl Future for DeliveryFuture {
    type Output = Result<Ack>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.ack_rx).poll(cx).map(|x| {
            x.unwrap_or_else(|_| {
                Err(Error::delivery_failed(
                    "producer stopped before acknowledgement",
                ))
            })
        })
    }
}

/// Outcome of a non-blocking publish attempt.
#[derive(Debug)]
pub enum Admission {
    Accepted(DeliveryFuture),
    /// The target partition is at its pending byte bound; the record is handed back.
    Full(Record),
}

struct Inner<C: Connector> {
    connections: Arc<ConnectionManager<C>>,
    accumulator: Accumulator,
    partitioner: Box<dyn Partitioner>,

    config: ProducerConfig,
    producer_id: u64,
    retry_backoff: Backoff,

    closed: AtomicBool,
    forced_flushes: AtomicUsize,
    batch_ready: Notify,

    dispatches: Mutex<Vec<JoinHandle<()>>>,
}

pub struct Producer<C: Connector> {
    inner: Arc<Inner<C>>,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> Producer<C> {
    pub fn new(connections: Arc<ConnectionManager<C>>, config: ProducerConfig) -> Self {
        Self::with_partitioner(connections, config, DefaultPartitioner::new())
    }

    /// Creates a producer and spawns its sender task. Must be called from within a tokio
    /// runtime.
    pub fn with_partitioner<P: Partitioner>(
        connections: Arc<ConnectionManager<C>>,
        config: ProducerConfig,
        partitioner: P,
    ) -> Self {
        let inner = Arc::new(Inner {
            connections,
            accumulator: Accumulator::new(
                config.max_batch_bytes,
                config.max_pending_bytes,
                config.linger(),
            ),
            partitioner: Box::new(partitioner),
            retry_backoff: Backoff::new(
                Duration::from_millis(config.retry_backoff_ms),
                Duration::from_millis(config.retry_backoff_max_ms),
            ),
            config,
            producer_id: rand::random(),
            closed: AtomicBool::new(false),
            forced_flushes: AtomicUsize::new(0),
            batch_ready: Notify::new(),
            dispatches: Mutex::new(Vec::new()),
        });

        let sender = tokio::spawn(
            Inner::run_sender(inner.clone())
                .instrument(info_span!("producer_sender", producer_id = inner.producer_id)),
        );

        Self {
            inner,
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.inner.config
    }

    /// Assigns `record` to a partition and queues it without waiting for buffer space.
    pub async fn try_publish(&self, record: Record) -> Result<Admission> {
        let inner = &self.inner;

        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::stopped("producer is closed"));
        }

        if record.size() > inner.accumulator.max_pending_bytes() {
            return Err(Error::new(
                ErrorKind::RecordTooLarge,
                format!(
                    "record of {} bytes exceeds max_pending_bytes {}",
                    record.size(),
                    inner.accumulator.max_pending_bytes()
                ),
            ));
        }

        let partition_count = inner.connections.partition_count(&record.topic).await?;
        let partition =
            inner
                .partitioner
                .partition(&record.topic, record.key.as_deref(), partition_count);

        let (topic, produced) = record.into_produced();
        let topic_partition = TopicPartition::new(topic, partition);

        let (ack_tx, ack_rx) = oneshot::channel();

        match inner
            .accumulator
            .try_append(&topic_partition, produced, ack_tx)
        {
            Ok(appended) => {
                if matches!(appended, Appended::First | Appended::BatchFull) {
                    inner.batch_ready.notify_one();
                }

                Ok(Admission::Accepted(DeliveryFuture { ack_rx }))
            }
            Err(Rejected::Full(produced, _)) => Ok(Admission::Full(Record::from_produced(
                topic_partition.topic,
                produced,
            ))),
            // close() drained the queue while partitions were being resolved
            Err(Rejected::Closed) => Err(Error::stopped("producer is closed")),
        }
    }

    /// Receiver that changes whenever buffered bytes are released.
    pub fn space_freed(&self) -> watch::Receiver<u64> {
        self.inner.accumulator.space_freed()
    }

    /// Bytes buffered or in flight for `topic_partition`.
    pub fn pending_bytes(&self, topic_partition: &TopicPartition) -> usize {
        self.inner.accumulator.pending_bytes(topic_partition)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Sends every buffered record regardless of linger and waits until all of them resolved.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        self.inner.forced_flushes.fetch_add(1, Ordering::AcqRel);
        self.inner.batch_ready.notify_one();

        let result = self.inner.wait_until_empty(Instant::now() + timeout).await;

        self.inner.forced_flushes.fetch_sub(1, Ordering::AcqRel);

        result
    }

    /// Stops accepting records and drains: waits up to `timeout` for every outstanding future
    /// to resolve. Futures still unresolved at the deadline are failed, so none is left pending.
    /// Idempotent.
    #[instrument(skip(self), fields(producer_id = self.inner.producer_id))]
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;

        if !inner.closed.swap(true, Ordering::AcqRel) {
            info!("closing producer");
        }

        inner.batch_ready.notify_one();

        let result = inner.wait_until_empty(Instant::now() + timeout).await;

        if let Err(err) = &result {
            warn!(error = %err, "producer drain timed out, failing outstanding records");
        }

        let sender = self.sender.lock().ok().and_then(|mut x| x.take());

        // no dispatch is spawned once the sender task has unwound
        if let Some(sender) = sender {
            sender.abort();
            let _ = sender.await;
        }

        let dispatches: Vec<_> = inner
            .dispatches
            .lock()
            .map(|mut x| x.drain(..).collect())
            .unwrap_or_default();

        for dispatch in &dispatches {
            dispatch.abort();
        }

        // aborted dispatches drop their acknowledgement senders, failing those futures
        for dispatch in dispatches {
            let _ = dispatch.await;
        }

        inner.accumulator.clear_in_flight();

        for pending in inner.accumulator.take_queued() {
            let _ = pending
                .ack_tx
                .send(Err(Error::delivery_failed("producer closed before send")));
        }

        result
    }
}

impl<C: Connector> Drop for Producer<C> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.get_mut().ok().and_then(|x| x.take()) {
            sender.abort();
        }
    }
}

impl<C: Connector> Inner<C> {
    async fn wait_until_empty(&self, deadline: Instant) -> Result<()> {
        let mut space_freed = self.accumulator.space_freed();

        loop {
            if self.accumulator.is_empty() {
                return Ok(());
            }

            match tokio::time::timeout_at(deadline, space_freed.changed()).await {
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return Err(Error::stopped("producer dropped")),
                Err(_) => return Err(Error::timed_out("records still outstanding")),
            }
        }
    }

    async fn run_sender(inner: Arc<Self>) {
        loop {
            let force = inner.closed.load(Ordering::Acquire)
                || inner.forced_flushes.load(Ordering::Acquire) > 0;

            let (batches, next_deadline) = inner.accumulator.drain_ready(Instant::now(), force);

            for batch in batches {
                let dispatch = tokio::spawn(
                    Self::dispatch(inner.clone(), batch)
                        .instrument(info_span!("producer_dispatch")),
                );

                if let Ok(mut dispatches) = inner.dispatches.lock() {
                    dispatches.retain(|x| !x.is_finished());
                    dispatches.push(dispatch);
                }
            }

            let wake_at = next_deadline.unwrap_or_else(|| Instant::now() + IDLE_WAIT);

            tokio::select! {
                _ = inner.batch_ready.notified() => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn dispatch(inner: Arc<Self>, batch: Batch) {
        let Batch {
            topic_partition,
            base_sequence,
            records,
            bytes,
        } = batch;

        let request = Request::Produce {
            topic_partition: topic_partition.clone(),
            producer_id: inner.producer_id,
            base_sequence,
            records: records.iter().map(|x| x.record.clone()).collect(),
        };

        debug!(%topic_partition, base_sequence, records = records.len(), bytes, "sending batch");

        let result = inner.send_with_retries(&topic_partition, &request).await;

        inner.resolve(&topic_partition, records, result);
        inner.accumulator.complete(&topic_partition);
        inner.batch_ready.notify_one();
    }

    async fn send_with_retries(
        &self,
        topic_partition: &TopicPartition,
        request: &Request,
    ) -> Result<u64> {
        let mut retries = 0;

        loop {
            let err = match self
                .connections
                .request_leader(topic_partition, request)
                .await
            {
                Ok(Response::Produced { base_offset }) => return Ok(base_offset),
                Ok(response) => unexpected_response(request.name(), &response),
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(Error::delivery_failed(err.to_string()));
            }

            if retries >= self.config.max_retries {
                return Err(Error::delivery_failed(format!(
                    "{} retries exhausted, last error: {}",
                    retries, err
                )));
            }

            let delay = self.retry_backoff.delay(retries);
            warn!(%topic_partition, retries, ?delay, error = %err, "batch send failed, retrying");

            tokio::time::sleep(delay).await;
            retries += 1;
        }
    }

    fn resolve(
        &self,
        topic_partition: &TopicPartition,
        records: Vec<PendingRecord>,
        result: Result<u64>,
    ) {
        match result {
            Ok(base_offset) => {
                debug!(%topic_partition, base_offset, records = records.len(), "batch acknowledged");

                for (i, pending) in records.into_iter().enumerate() {
                    let _ = pending.ack_tx.send(Ok(Ack {
                        topic_partition: topic_partition.clone(),
                        offset: base_offset + i as u64,
                    }));
                }
            }
            Err(err) => {
                error!(%topic_partition, records = records.len(), error = %err, "batch delivery failed");

                for pending in records {
                    let _ = pending.ack_tx.send(Err(err.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        super::{
            broker::in_memory::{BrokerConfig, InMemoryBroker, InMemoryConnector},
            config::ConnectionConfig,
            protocol::ErrorCode,
        },
        *,
    };
    use bytes::Bytes;

    fn connection_config() -> ConnectionConfig {
        ConnectionConfig {
            brokers: vec!["loopback:9092".into()],
            connect_timeout_ms: 1_000,
            request_timeout_ms: 1_000,
            reconnect_backoff_base_ms: 1,
            reconnect_backoff_cap_ms: 10,
            reconnect_attempts: 3,
            metadata_refresh_interval_ms: 60_000,
        }
    }

    fn producer_config() -> ProducerConfig {
        ProducerConfig {
            linger_ms: 5,
            max_batch_bytes: 4 * 1024,
            max_pending_bytes: 64 * 1024,
            max_retries: 3,
            retry_backoff_ms: 1,
            retry_backoff_max_ms: 5,
            max_block_ms: 1_000,
        }
    }

    async fn setup(
        partitions: u32,
        config: ProducerConfig,
    ) -> (Arc<InMemoryBroker>, Producer<InMemoryConnector>) {
        let broker = InMemoryBroker::new(BrokerConfig::default());
        broker.create_topic("some_topic", partitions);

        let connections =
            ConnectionManager::connect(InMemoryConnector::new(broker.clone()), connection_config())
                .await
                .unwrap();

        (broker, Producer::new(connections, config))
    }

    async fn publish(producer: &Producer<InMemoryConnector>, payload: &str) -> DeliveryFuture {
        match producer
            .try_publish(Record::new(
                "some_topic",
                None,
                Bytes::copy_from_slice(payload.as_bytes()),
            ))
            .await
            .unwrap()
        {
            Admission::Accepted(future) => future,
            Admission::Full(_) => panic!("partition unexpectedly full"),
        }
    }

    #[tokio::test]
    async fn test_offsets_increase_in_submission_order() {
        let (broker, producer) = setup(1, producer_config()).await;

        let records = [
            "Lorem", "ipsum", "dolor", "sit", "amet,", "consectetur", "adipiscing", "elit.",
        ];

        let mut futures = Vec::new();
        for record in records {
            futures.push(publish(&producer, record).await);
        }

        let mut last_offset = None;
        for future in futures {
            let ack = future.await.unwrap();
            assert_eq!(ack.topic_partition, TopicPartition::new("some_topic", 0));

            if let Some(last_offset) = last_offset {
                assert!(ack.offset > last_offset);
            }
            last_offset = Some(ack.offset);
        }

        let stored = broker.records(&TopicPartition::new("some_topic", 0));
        assert_eq!(stored.len(), records.len());

        for (record, expected) in stored.iter().zip(records) {
            assert_eq!(record.payload, expected.as_bytes());
        }

        producer.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_retriable_errors_are_retried() {
        let (broker, producer) = setup(1, producer_config()).await;

        broker.fail_next_produces(2, ErrorCode::LeaderNotAvailable);

        let ack = publish(&producer, "Lorem").await.await.unwrap();
        assert_eq!(ack.offset, 0);
        assert_eq!(broker.produce_requests(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fail_every_record_in_batch() {
        let (broker, producer) = setup(
            1,
            ProducerConfig {
                linger_ms: 200,
                ..producer_config()
            },
        )
        .await;

        broker.pause_produces();
        let first = publish(&producer, "Lorem").await;
        let second = publish(&producer, "ipsum").await;

        broker.fail_next_produces(4, ErrorCode::LeaderNotAvailable);
        broker.resume_produces();

        for future in [first, second] {
            assert_eq!(
                future.await.unwrap_err().kind(),
                ErrorKind::DeliveryFailed
            );
        }

        // one initial attempt plus max_retries
        assert_eq!(broker.produce_requests(), 4);
        assert_eq!(broker.partition_len(&TopicPartition::new("some_topic", 0)), 0);

        // the partition is usable again afterwards
        assert_eq!(publish(&producer, "dolor").await.await.unwrap().offset, 0);
    }

    #[tokio::test]
    async fn test_lost_acknowledgement_does_not_duplicate() {
        let (broker, producer) = setup(1, producer_config()).await;

        broker.lose_next_produce_responses(1);

        let mut futures = Vec::new();
        for record in ["Lorem", "ipsum", "dolor"] {
            futures.push(publish(&producer, record).await);
        }

        let mut offsets = Vec::new();
        for future in futures {
            offsets.push(future.await.unwrap().offset);
        }

        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(broker.partition_len(&TopicPartition::new("some_topic", 0)), 3);
    }

    #[tokio::test]
    async fn test_full_partition_hands_record_back() {
        let size = Record::new("some_topic", None, Bytes::from_static(b"Lorem")).size();

        let (broker, producer) = setup(
            1,
            ProducerConfig {
                max_batch_bytes: size,
                max_pending_bytes: size * 2,
                ..producer_config()
            },
        )
        .await;

        broker.pause_produces();

        let first = publish(&producer, "Lorem").await;
        let second = publish(&producer, "ipsum").await;

        match producer
            .try_publish(Record::new("some_topic", None, Bytes::from_static(b"dolor")))
            .await
            .unwrap()
        {
            Admission::Full(record) => assert_eq!(record.payload, "dolor"),
            Admission::Accepted(_) => panic!("admitted beyond max_pending_bytes"),
        }

        assert_eq!(
            producer.pending_bytes(&TopicPartition::new("some_topic", 0)),
            size * 2
        );

        assert_eq!(
            producer
                .try_publish(Record::new(
                    "some_topic",
                    None,
                    Bytes::from(vec![0; size * 2])
                ))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::RecordTooLarge
        );

        broker.resume_produces();

        assert_eq!(first.await.unwrap().offset, 0);
        assert_eq!(second.await.unwrap().offset, 1);
    }

    #[tokio::test]
    async fn test_keyed_records_share_a_partition() {
        let (broker, producer) = setup(4, producer_config()).await;

        let mut futures = Vec::new();
        for payload in ["created", "paid", "shipped"] {
            match producer
                .try_publish(Record::new(
                    "some_topic",
                    Some(Bytes::from_static(b"order-17")),
                    Bytes::from_static(payload.as_bytes()),
                ))
                .await
                .unwrap()
            {
                Admission::Accepted(future) => futures.push(future),
                Admission::Full(_) => panic!("partition unexpectedly full"),
            }
        }

        let mut acks = Vec::new();
        for future in futures {
            acks.push(future.await.unwrap());
        }

        let partition = crc32fast::hash(b"order-17") % 4;
        assert!(acks
            .iter()
            .all(|x| x.topic_partition.partition == partition));
        assert_eq!(
            broker.partition_len(&TopicPartition::new("some_topic", partition)),
            3
        );
    }

    #[tokio::test]
    async fn test_close_resolves_every_future() {
        let (broker, producer) = setup(2, producer_config()).await;

        broker.pause_produces();

        let mut futures = Vec::new();
        for record in ["Lorem", "ipsum", "dolor", "sit"] {
            futures.push(publish(&producer, record).await);
        }

        assert_eq!(
            producer
                .close(Duration::from_millis(50))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::TimedOut
        );

        for future in futures {
            assert_eq!(
                future.await.unwrap_err().kind(),
                ErrorKind::DeliveryFailed
            );
        }

        assert_eq!(
            producer
                .try_publish(Record::new("some_topic", None, Bytes::from_static(b"amet")))
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::Stopped
        );

        producer.close(Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_racing_close_is_rejected() {
        let (broker, producer) = setup(1, producer_config()).await;
        let producer = Arc::new(producer);

        broker.pause_metadata();
        let metadata_requests = broker.metadata_requests();

        // an unknown topic needs a metadata lookup, which the broker holds
        let publish = tokio::spawn({
            let producer = producer.clone();
            async move {
                producer
                    .try_publish(Record::new(
                        "fresh_topic",
                        None,
                        Bytes::from_static(b"Lorem"),
                    ))
                    .await
            }
        });

        while broker.metadata_requests() == metadata_requests {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        producer.close(Duration::from_millis(50)).await.unwrap();
        broker.resume_metadata();

        assert_eq!(
            publish.await.unwrap().unwrap_err().kind(),
            ErrorKind::Stopped
        );
    }

    #[tokio::test]
    async fn test_flush_sends_before_linger() {
        let (broker, producer) = setup(
            1,
            ProducerConfig {
                linger_ms: 60_000,
                ..producer_config()
            },
        )
        .await;

        let future = publish(&producer, "Lorem").await;

        producer.flush(Duration::from_secs(1)).await.unwrap();

        assert_eq!(future.await.unwrap().offset, 0);
        assert_eq!(broker.partition_len(&TopicPartition::new("some_topic", 0)), 1);
    }
}
