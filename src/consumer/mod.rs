//! Module providing the consumer core: partition positions, long-poll fetching, ordered delivery
//! to a handler, redelivery of failed records and offset commits.
//!
//! A [`Consumer`] owns the fetch state of its assigned partitions. Records of one partition are
//! delivered strictly in offset order; a failed record halts its partition, which is rewound to
//! that record and paused for the redelivery delay. Records that keep failing past
//! `max_redeliveries` are handed to a [`DeadLetterSink`] and skipped. Offsets are committed
//! through a shared [`OffsetCommitter`], which makes delivery at-least-once: a record is only
//! committed after its handler succeeded or it was dead-lettered.

use super::{
    config::{CommitMode, ConsumerConfig},
    connection::{ConnectionManager, Connector},
    error::{Error, Result},
    protocol::{unexpected_response, Request, Response, TopicPartition},
    record::ConsumerRecord,
};
use futures_util::{stream::FuturesUnordered, FutureExt, StreamExt};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::watch, time::Instant};
use tracing::{debug, error, info, instrument, warn};

pub mod handler;
pub mod offsets;

pub use handler::{
    handler_fn, ChannelDeadLetterSink, DeadLetter, DeadLetterSink, FnHandler, Handler,
    LoggingDeadLetterSink, TopicDeadLetterSink,
};
pub use offsets::OffsetCommitter;

/// Pause after a fetch round in which some partition failed.
const FETCH_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPhase {
    Idle,
    Fetching,
    Delivering,
    Committing,
    Stopped,
}

struct PartitionState {
    phase: PartitionPhase,

    /// Next offset to request from the broker.
    fetch_offset: u64,
    /// Next offset to hand out from `poll`.
    position: u64,
    buffered: VecDeque<ConsumerRecord>,

    paused_until: Option<Instant>,
    /// Offset of the record currently failing and how many deliveries of it failed.
    failures: Option<(u64, u32)>,
}

impl PartitionState {
    fn new(offset: u64) -> Self {
        Self {
            phase: PartitionPhase::Idle,
            fetch_offset: offset,
            position: offset,
            buffered: VecDeque::new(),
            paused_until: None,
            failures: None,
        }
    }

    fn is_paused(&self, now: Instant) -> bool {
        self.paused_until.map_or(false, |x| now < x)
    }

    fn is_active(&self, now: Instant) -> bool {
        self.phase != PartitionPhase::Stopped && !self.is_paused(now)
    }

    fn seek(&mut self, offset: u64) {
        self.buffered.clear();
        self.fetch_offset = offset;
        self.position = offset;
    }
}

pub struct Consumer<C: Connector> {
    connections: Arc<ConnectionManager<C>>,
    committer: Arc<OffsetCommitter<C>>,
    config: ConsumerConfig,

    partitions: BTreeMap<TopicPartition, PartitionState>,

    running: bool,
    last_commit: Instant,
}

impl<C: Connector> Consumer<C> {
    /// Subscribes `group_id` to every partition of `topic`.
    pub async fn subscribe(
        connections: Arc<ConnectionManager<C>>,
        topic: &str,
        group_id: &str,
        config: ConsumerConfig,
    ) -> Result<Self> {
        let partition_count = connections.partition_count(topic).await?;
        let partitions = (0..partition_count)
            .map(|partition| TopicPartition::new(topic, partition))
            .collect();

        Self::assign(connections, group_id, partitions, config).await
    }

    /// Creates a consumer for an explicit set of partitions. Each partition starts at the
    /// group's committed offset, or at the earliest offset when the group never committed.
    #[instrument(skip(connections, config))]
    pub async fn assign(
        connections: Arc<ConnectionManager<C>>,
        group_id: &str,
        partitions: Vec<TopicPartition>,
        config: ConsumerConfig,
    ) -> Result<Self> {
        if partitions.is_empty() {
            return Err(Error::config_invalid("no partitions to consume"));
        }

        let committer = Arc::new(OffsetCommitter::new(connections.clone(), group_id));

        let partitions = committer
            .fetch_committed(&partitions)
            .await?
            .into_iter()
            .map(|(topic_partition, offset)| {
                debug!(%topic_partition, ?offset, "starting position");
                (topic_partition, PartitionState::new(offset.unwrap_or(0)))
            })
            .collect();

        Ok(Self {
            connections,
            committer,
            config,
            partitions,
            running: true,
            last_commit: Instant::now(),
        })
    }

    pub fn group_id(&self) -> &str {
        self.committer.group_id()
    }

    pub fn committer(&self) -> Arc<OffsetCommitter<C>> {
        self.committer.clone()
    }

    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.partitions.keys().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Offset of the next record `poll` returns for `topic_partition`.
    pub fn position(&self, topic_partition: &TopicPartition) -> Option<u64> {
        self.partitions.get(topic_partition).map(|x| x.position)
    }

    pub fn committed(&self, topic_partition: &TopicPartition) -> Option<u64> {
        self.committer.committed(topic_partition)
    }

    pub fn phase(&self, topic_partition: &TopicPartition) -> Option<PartitionPhase> {
        self.partitions.get(topic_partition).map(|x| x.phase)
    }

    fn partition_mut(&mut self, topic_partition: &TopicPartition) -> Result<&mut PartitionState> {
        self.partitions.get_mut(topic_partition).ok_or_else(|| {
            Error::config_invalid(format!("partition {} is not assigned", topic_partition))
        })
    }

    /// Moves the position of `topic_partition` to `offset`, discarding buffered records.
    pub fn seek(&mut self, topic_partition: &TopicPartition, offset: u64) -> Result<()> {
        self.partition_mut(topic_partition)?.seek(offset);
        Ok(())
    }

    /// Excludes `topic_partition` from fetching and delivery until `until`.
    pub fn pause_until(&mut self, topic_partition: &TopicPartition, until: Instant) -> Result<()> {
        self.partition_mut(topic_partition)?.paused_until = Some(until);
        Ok(())
    }

    /// Returns the available records, waiting up to `timeout` for some to arrive. Records of a
    /// partition are contiguous and in offset order. Fetch failures are logged and retried
    /// within the timeout; an expired timeout yields an empty batch.
    pub async fn poll(&mut self, timeout: Duration) -> Vec<ConsumerRecord> {
        let deadline = Instant::now() + timeout;

        loop {
            let now = Instant::now();

            let records = self.take_buffered(now);
            if !records.is_empty() || now >= deadline || !self.running {
                return records;
            }

            let resume_at = self
                .partitions
                .values()
                .filter(|x| x.phase != PartitionPhase::Stopped)
                .filter_map(|x| x.paused_until.filter(|until| *until > now))
                .min();

            let wake_at = resume_at.map_or(deadline, |x| x.min(deadline));

            let fetchable: Vec<_> = self
                .partitions
                .iter_mut()
                .filter(|(_, state)| state.is_active(now))
                .map(|(topic_partition, state)| {
                    state.phase = PartitionPhase::Fetching;
                    (topic_partition.clone(), state.fetch_offset)
                })
                .collect();

            if fetchable.is_empty() {
                tokio::time::sleep_until(wake_at).await;
                continue;
            }

            let max_wait = wake_at
                .saturating_duration_since(now)
                .min(self.connections.config().request_timeout() / 2);

            let mut fetches: FuturesUnordered<_> = fetchable
                .into_iter()
                .map(|(topic_partition, offset)| {
                    fetch(
                        self.connections.clone(),
                        topic_partition,
                        offset,
                        self.config.fetch_max_bytes as u64,
                        max_wait,
                    )
                })
                .collect();

            let mut failed = false;

            while let Some((topic_partition, offset, result)) = fetches.next().await {
                let fetched = self.apply_fetch(topic_partition, offset, result, &mut failed);

                // collect whatever else already completed, drop the fetches still waiting
                if fetched {
                    while let Some(Some((topic_partition, offset, result))) =
                        fetches.next().now_or_never()
                    {
                        self.apply_fetch(topic_partition, offset, result, &mut failed);
                    }

                    break;
                }
            }

            drop(fetches);

            for state in self.partitions.values_mut() {
                if state.phase == PartitionPhase::Fetching {
                    state.phase = PartitionPhase::Idle;
                }
            }

            if failed {
                tokio::time::sleep_until((Instant::now() + FETCH_ERROR_BACKOFF).min(deadline))
                    .await;
            }
        }
    }

    /// Buffers fetched records, returning whether any new record arrived.
    fn apply_fetch(
        &mut self,
        topic_partition: TopicPartition,
        offset: u64,
        result: Result<Vec<ConsumerRecord>>,
        failed: &mut bool,
    ) -> bool {
        let Some(state) = self.partitions.get_mut(&topic_partition) else {
            return false;
        };

        state.phase = PartitionPhase::Idle;

        match result {
            Ok(records) => {
                let before = state.buffered.len();

                for record in records {
                    if record.offset >= state.fetch_offset {
                        state.fetch_offset = record.offset + 1;
                        state.buffered.push_back(record);
                    }
                }

                state.buffered.len() > before
            }
            Err(err) => {
                warn!(%topic_partition, offset, error = %err, "fetch failed");
                *failed = true;
                false
            }
        }
    }

    fn take_buffered(&mut self, now: Instant) -> Vec<ConsumerRecord> {
        let mut records = Vec::new();

        for state in self.partitions.values_mut() {
            if !state.is_active(now) || state.buffered.is_empty() {
                continue;
            }

            state.phase = PartitionPhase::Delivering;
            records.extend(state.buffered.drain(..));

            if let Some(last) = records.last() {
                state.position = last.offset + 1;
            }
        }

        records
    }

    /// Hands `records` to `handler` in order and returns how many were settled, either handled
    /// or dead-lettered. A failure halts the rest of its partition for this batch.
    pub async fn process<H, D>(
        &mut self,
        records: Vec<ConsumerRecord>,
        handler: &H,
        dead_letters: &D,
    ) -> usize
    where
        H: Handler + ?Sized,
        D: DeadLetterSink + ?Sized,
    {
        let mut settled = 0;
        let mut halted = BTreeSet::new();

        for record in records {
            if halted.contains(&record.topic_partition) {
                continue;
            }

            let outcome = handler.handle(&record).await;

            let topic_partition = record.topic_partition.clone();
            let offset = record.offset;

            let Some(state) = self.partitions.get_mut(&topic_partition) else {
                continue;
            };

            let err = match outcome {
                Ok(()) => {
                    state.failures = None;
                    Self::settle(&self.committer, self.config.commit_mode, &topic_partition, offset);
                    settled += 1;
                    continue;
                }
                Err(err) => err,
            };

            let failures = match state.failures {
                Some((failing, count)) if failing == offset => count + 1,
                _ => 1,
            };

            if failures <= self.config.max_redeliveries {
                warn!(
                    %topic_partition,
                    offset,
                    failures,
                    error = %err,
                    "record processing failed, scheduling redelivery"
                );
            } else {
                let dead_letter = DeadLetter {
                    record,
                    reason: format!("failed {} deliveries, last error: {}", failures, err),
                };

                match dead_letters.send(dead_letter).await {
                    Ok(()) => {
                        warn!(%topic_partition, offset, failures, "record dead-lettered");

                        state.failures = None;
                        Self::settle(
                            &self.committer,
                            self.config.commit_mode,
                            &topic_partition,
                            offset,
                        );
                        settled += 1;
                        continue;
                    }
                    Err(sink_err) => {
                        error!(%topic_partition, offset, error = %sink_err, "dead letter sink failed");
                    }
                }
            }

            state.failures = Some((offset, failures));
            state.seek(offset);
            state.paused_until = Some(Instant::now() + self.config.redelivery_delay());

            halted.insert(topic_partition);
        }

        settled
    }

    fn settle(
        committer: &OffsetCommitter<C>,
        commit_mode: CommitMode,
        topic_partition: &TopicPartition,
        offset: u64,
    ) {
        if commit_mode == CommitMode::Auto {
            committer.stage(topic_partition, offset + 1);
        }
    }

    /// Commits `offsets` for this consumer's group. Each offset is the next offset to consume.
    pub async fn commit(&self, offsets: &[(TopicPartition, u64)]) -> Result<()> {
        self.committer.commit(offsets).await
    }

    async fn commit_staged(&mut self) -> Result<()> {
        if !self.committer.has_staged() {
            return Ok(());
        }

        for state in self.partitions.values_mut() {
            if state.phase != PartitionPhase::Stopped {
                state.phase = PartitionPhase::Committing;
            }
        }

        let result = self.committer.commit_staged().await;
        self.last_commit = Instant::now();

        for state in self.partitions.values_mut() {
            if state.phase == PartitionPhase::Committing {
                state.phase = PartitionPhase::Idle;
            }
        }

        result
    }

    async fn maybe_auto_commit(&mut self) {
        if self.config.commit_mode != CommitMode::Auto {
            return;
        }

        if Instant::now() < self.last_commit + self.config.auto_commit_interval() {
            return;
        }

        // failed commits stay staged and are retried on the next round
        let _ = self.commit_staged().await;
    }

    /// Stops the consumer: commits pending offsets and marks every partition stopped.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.running = false;

        let result = self.commit_staged().await;

        for state in self.partitions.values_mut() {
            state.phase = PartitionPhase::Stopped;
            state.buffered.clear();
        }

        info!(group_id = self.group_id(), "consumer stopped");

        result
    }

    /// Polls and processes records until `shutdown` turns true or its sender is dropped. The
    /// current batch is finished before the loop exits; pending offsets are committed on exit.
    pub async fn run<H, D>(
        mut self,
        handler: H,
        dead_letters: D,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        H: Handler,
        D: DeadLetterSink,
    {
        info!(
            group_id = self.group_id(),
            partitions = self.partitions.len(),
            "consumer loop started"
        );

        let poll_timeout = self.config.poll_timeout();

        while !*shutdown.borrow() {
            let records = tokio::select! {
                records = self.poll(poll_timeout) => records,
                _ = shutdown.changed() => break,
            };

            if !records.is_empty() {
                let count = records.len();
                let settled = self.process(records, &handler, &dead_letters).await;
                debug!(count, settled, "processed records");
            }

            self.maybe_auto_commit().await;
        }

        self.shutdown().await
    }
}

async fn fetch<C: Connector>(
    connections: Arc<ConnectionManager<C>>,
    topic_partition: TopicPartition,
    offset: u64,
    max_bytes: u64,
    max_wait: Duration,
) -> (TopicPartition, u64, Result<Vec<ConsumerRecord>>) {
    let request = Request::Fetch {
        topic_partition: topic_partition.clone(),
        offset,
        max_bytes,
        max_wait_ms: max_wait.as_millis() as u64,
    };

    let result = match connections.request_leader(&topic_partition, &request).await {
        Ok(Response::Fetched { records, .. }) => Ok(records
            .into_iter()
            .map(|x| ConsumerRecord::from_stored(topic_partition.clone(), x))
            .collect()),
        Ok(response) => Err(unexpected_response(request.name(), &response)),
        Err(err) => Err(err),
    };

    (topic_partition, offset, result)
}

impl<C: Connector> std::fmt::Debug for Consumer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("group_id", &self.group_id())
            .field("assignment", &self.assignment())
            .field("running", &self.running)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        super::{
            broker::in_memory::{BrokerConfig, InMemoryBroker, InMemoryConnector},
            config::ConnectionConfig,
            error::ErrorKind,
        },
        *,
    };
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    fn connection_config() -> ConnectionConfig {
        ConnectionConfig {
            brokers: vec!["loopback:9092".into()],
            connect_timeout_ms: 1_000,
            request_timeout_ms: 2_000,
            reconnect_backoff_base_ms: 1,
            reconnect_backoff_cap_ms: 10,
            reconnect_attempts: 3,
            metadata_refresh_interval_ms: 60_000,
        }
    }

    fn consumer_config() -> ConsumerConfig {
        ConsumerConfig {
            poll_timeout_ms: 100,
            fetch_max_bytes: 64 * 1024,
            commit_mode: CommitMode::Auto,
            auto_commit_interval_ms: 0,
            max_redeliveries: 2,
            redelivery_delay_ms: 10,
        }
    }

    async fn setup(
        partitions: u32,
    ) -> (Arc<InMemoryBroker>, Arc<ConnectionManager<InMemoryConnector>>) {
        let broker = InMemoryBroker::new(BrokerConfig::default());
        broker.create_topic("orders", partitions);

        let connections =
            ConnectionManager::connect(InMemoryConnector::new(broker.clone()), connection_config())
                .await
                .unwrap();

        (broker, connections)
    }

    async fn poll_at_least(
        consumer: &mut Consumer<InMemoryConnector>,
        count: usize,
    ) -> Vec<ConsumerRecord> {
        let mut records = Vec::new();

        for _ in 0..20 {
            records.extend(consumer.poll(Duration::from_millis(200)).await);

            if records.len() >= count {
                break;
            }
        }

        records
    }

    #[tokio::test]
    async fn test_poll_preserves_partition_order() {
        let (broker, connections) = setup(2).await;

        let (first, second) = (
            TopicPartition::new("orders", 0),
            TopicPartition::new("orders", 1),
        );

        broker.append(&first, &[b"Lorem", b"ipsum", b"dolor"]);
        broker.append(&second, &[b"sit", b"amet,"]);

        let mut consumer = Consumer::subscribe(connections, "orders", "billing", consumer_config())
            .await
            .unwrap();

        assert_eq!(consumer.assignment(), vec![first.clone(), second.clone()]);
        assert_eq!(consumer.position(&first), Some(0));

        let records = poll_at_least(&mut consumer, 5).await;
        assert_eq!(records.len(), 5);

        for topic_partition in [&first, &second] {
            let offsets: Vec<_> = records
                .iter()
                .filter(|x| &x.topic_partition == topic_partition)
                .map(|x| x.offset)
                .collect();

            assert!(offsets.windows(2).all(|x| x[0] < x[1]));
        }

        let payloads: Vec<_> = records
            .iter()
            .filter(|x| x.topic_partition == first)
            .map(|x| x.payload.clone())
            .collect();
        assert_eq!(payloads, vec!["Lorem", "ipsum", "dolor"]);

        assert_eq!(consumer.position(&first), Some(3));
        assert_eq!(consumer.position(&second), Some(2));
        assert_ne!(consumer.phase(&first), Some(PartitionPhase::Stopped));
    }

    #[tokio::test]
    async fn test_poll_timeout_yields_empty_batch() {
        let (_broker, connections) = setup(1).await;

        let mut consumer = Consumer::subscribe(connections, "orders", "billing", consumer_config())
            .await
            .unwrap();

        let start = Instant::now();
        let records = consumer.poll(Duration::from_millis(50)).await;

        assert!(records.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_seek_and_pause() {
        let (broker, connections) = setup(1).await;
        let topic_partition = TopicPartition::new("orders", 0);

        broker.append(&topic_partition, &[b"Lorem", b"ipsum", b"dolor"]);

        let mut consumer = Consumer::subscribe(connections, "orders", "billing", consumer_config())
            .await
            .unwrap();

        consumer.seek(&topic_partition, 1).unwrap();

        let records = poll_at_least(&mut consumer, 2).await;
        assert_eq!(
            records.iter().map(|x| x.offset).collect::<Vec<_>>(),
            vec![1, 2]
        );

        consumer.seek(&topic_partition, 0).unwrap();
        consumer
            .pause_until(&topic_partition, Instant::now() + Duration::from_secs(60))
            .unwrap();
        assert!(consumer.poll(Duration::from_millis(30)).await.is_empty());

        assert_eq!(
            consumer
                .seek(&TopicPartition::new("payments", 0), 0)
                .unwrap_err()
                .kind(),
            ErrorKind::ConfigInvalid
        );
    }

    #[tokio::test]
    async fn test_failing_record_is_redelivered_then_dead_lettered() {
        let (broker, connections) = setup(1).await;
        let topic_partition = TopicPartition::new("orders", 0);

        broker.append(&topic_partition, &[b"Lorem", b"ipsum"]);

        let mut consumer = Consumer::subscribe(connections, "orders", "billing", consumer_config())
            .await
            .unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let calls = calls.clone();
            handler_fn(move |record: ConsumerRecord| {
                let calls = calls.clone();
                async move {
                    calls.lock().unwrap().push(record.offset);

                    if record.payload == "Lorem" {
                        Err(Error::processing_failed("cannot process Lorem"))
                    } else {
                        Ok(())
                    }
                }
            })
        };

        let (dead_letters, mut dead_letter_rx) = ChannelDeadLetterSink::new();

        let mut settled = 0;
        for _ in 0..50 {
            let records = consumer.poll(Duration::from_millis(100)).await;
            settled += consumer.process(records, &handler, &dead_letters).await;
            consumer.maybe_auto_commit().await;

            if settled == 2 {
                break;
            }
        }

        assert_eq!(settled, 2);

        // one delivery plus max_redeliveries, then the next record
        assert_eq!(*calls.lock().unwrap(), vec![0, 0, 0, 1]);

        let dead_letter = dead_letter_rx.recv().await.unwrap();
        assert_eq!(dead_letter.record.offset, 0);
        assert!(dead_letter.reason.contains("cannot process Lorem"));
        assert!(dead_letter_rx.try_recv().is_err());

        assert_eq!(broker.committed_offset("billing", &topic_partition), Some(2));
        assert_eq!(consumer.committed(&topic_partition), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_commit_waits_for_interval() {
        let (broker, connections) = setup(1).await;
        let topic_partition = TopicPartition::new("orders", 0);

        broker.append(&topic_partition, &[b"Lorem", b"ipsum"]);

        let mut consumer = Consumer::subscribe(
            connections,
            "orders",
            "billing",
            ConsumerConfig {
                auto_commit_interval_ms: 1_000,
                ..consumer_config()
            },
        )
        .await
        .unwrap();

        let handler = handler_fn(|_| async { Ok(()) });

        let records = poll_at_least(&mut consumer, 2).await;
        assert_eq!(
            consumer
                .process(records, &handler, &LoggingDeadLetterSink)
                .await,
            2
        );

        consumer.maybe_auto_commit().await;
        assert_eq!(broker.committed_offset("billing", &topic_partition), None);

        tokio::time::sleep(Duration::from_millis(500)).await;
        consumer.maybe_auto_commit().await;
        assert_eq!(broker.committed_offset("billing", &topic_partition), None);

        tokio::time::sleep(Duration::from_millis(500)).await;
        consumer.maybe_auto_commit().await;
        assert_eq!(broker.committed_offset("billing", &topic_partition), Some(2));
        assert_eq!(consumer.committed(&topic_partition), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_delay_holds_partition() {
        let (broker, connections) = setup(1).await;
        let topic_partition = TopicPartition::new("orders", 0);

        broker.append(&topic_partition, &[b"Lorem", b"ipsum"]);

        let mut consumer = Consumer::subscribe(
            connections,
            "orders",
            "billing",
            ConsumerConfig {
                redelivery_delay_ms: 500,
                ..consumer_config()
            },
        )
        .await
        .unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let handler = {
            let attempts = attempts.clone();
            handler_fn(move |record: ConsumerRecord| {
                let attempts = attempts.clone();
                async move {
                    if record.offset == 0 && attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::processing_failed("transient failure"))
                    } else {
                        Ok(())
                    }
                }
            })
        };

        let records = poll_at_least(&mut consumer, 2).await;
        assert_eq!(
            consumer
                .process(records, &handler, &LoggingDeadLetterSink)
                .await,
            0
        );

        let failed_at = Instant::now();
        assert_eq!(consumer.position(&topic_partition), Some(0));

        // neither the failed record nor its successors are handed out during the delay
        assert!(consumer.poll(Duration::from_millis(300)).await.is_empty());

        let records = consumer.poll(Duration::from_secs(2)).await;
        assert!(failed_at.elapsed() >= Duration::from_millis(500));
        assert_eq!(
            records.iter().map(|x| x.offset).collect::<Vec<_>>(),
            vec![0, 1]
        );

        assert_eq!(
            consumer
                .process(records, &handler, &LoggingDeadLetterSink)
                .await,
            2
        );
    }

    #[tokio::test]
    async fn test_uncommitted_records_are_redelivered() {
        let (broker, connections) = setup(1).await;
        let topic_partition = TopicPartition::new("orders", 0);

        broker.append(&topic_partition, &[b"Lorem", b"ipsum", b"dolor"]);

        let config = ConsumerConfig {
            commit_mode: CommitMode::Manual,
            ..consumer_config()
        };

        let handled = Arc::new(AtomicUsize::new(0));
        let handler = {
            let handled = handled.clone();
            handler_fn(move |_| {
                let handled = handled.clone();
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };

        let mut consumer =
            Consumer::subscribe(connections.clone(), "orders", "billing", config.clone())
                .await
                .unwrap();

        let records = poll_at_least(&mut consumer, 3).await;
        assert_eq!(
            consumer
                .process(records, &handler, &LoggingDeadLetterSink)
                .await,
            3
        );

        // crashed before committing
        drop(consumer);
        assert_eq!(broker.committed_offset("billing", &topic_partition), None);

        let mut consumer =
            Consumer::subscribe(connections.clone(), "orders", "billing", config.clone())
                .await
                .unwrap();

        let records = poll_at_least(&mut consumer, 3).await;
        assert_eq!(records.first().map(|x| x.offset), Some(0));
        consumer
            .process(records, &handler, &LoggingDeadLetterSink)
            .await;

        consumer.commit(&[(topic_partition.clone(), 3)]).await.unwrap();
        assert_eq!(handled.load(Ordering::SeqCst), 6);

        let mut consumer = Consumer::subscribe(connections, "orders", "billing", config)
            .await
            .unwrap();

        assert_eq!(consumer.position(&topic_partition), Some(3));
        assert!(consumer.poll(Duration::from_millis(30)).await.is_empty());
    }

    #[tokio::test]
    async fn test_run_commits_on_shutdown() {
        let (broker, connections) = setup(1).await;
        let topic_partition = TopicPartition::new("orders", 0);

        broker.append(&topic_partition, &[b"Lorem", b"ipsum"]);

        let consumer = Consumer::subscribe(
            connections,
            "orders",
            "billing",
            ConsumerConfig {
                auto_commit_interval_ms: 60_000,
                ..consumer_config()
            },
        )
        .await
        .unwrap();

        let (record_tx, mut record_rx) = tokio::sync::mpsc::unbounded_channel();
        let handler = handler_fn(move |record: ConsumerRecord| {
            let record_tx = record_tx.clone();
            async move {
                let _ = record_tx.send(record.offset);
                Ok(())
            }
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(consumer.run(handler, LoggingDeadLetterSink, shutdown_rx));

        assert_eq!(record_rx.recv().await, Some(0));
        assert_eq!(record_rx.recv().await, Some(1));
        assert_eq!(broker.committed_offset("billing", &topic_partition), None);

        shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();

        assert_eq!(broker.committed_offset("billing", &topic_partition), Some(2));
    }
}
