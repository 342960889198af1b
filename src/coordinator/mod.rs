//! Module providing the delivery coordinator, the public entry point of the client.
//!
//! The coordinator wires one [`ConnectionManager`] to a shared [`Producer`] and to the consumers
//! of every subscription. `publish` applies backpressure: while the target partition is at its
//! pending byte bound the caller waits for space, up to `max_block`. `stop` drains everything in
//! order: consumer loops finish their current batch and commit, then the producer resolves or
//! fails every outstanding delivery future, then connections are closed.

use super::{
    config::{CommitMode, Config},
    connection::{ConnectionManager, Connector},
    consumer::{
        offsets::OffsetCommitter, Consumer, DeadLetterSink, Handler, LoggingDeadLetterSink,
        TopicDeadLetterSink,
    },
    error::{Error, Result},
    producer::{Admission, DeliveryFuture, Producer},
    protocol::TopicPartition,
    record::Record,
};
use bytes::Bytes;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, OnceCell},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Per-subscription overrides of the consumer configuration.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub commit_mode: Option<CommitMode>,
    /// Consume only these partitions instead of every partition of the topic.
    pub partitions: Option<Vec<u32>>,
    /// Sink for records that exhausted their redeliveries; they are logged and dropped when
    /// unset.
    pub dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

impl SubscribeOptions {
    pub fn manual_commit() -> Self {
        Self {
            commit_mode: Some(CommitMode::Manual),
            ..Default::default()
        }
    }
}

/// Handle to a consumer group subscription registered with a [`DeliveryCoordinator`].
pub struct Subscription<C: Connector> {
    topic: String,
    assignment: Vec<TopicPartition>,
    committer: Arc<OffsetCommitter<C>>,
}

impl<C: Connector> Subscription<C> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        self.committer.group_id()
    }

    pub fn assignment(&self) -> &[TopicPartition] {
        &self.assignment
    }

    pub fn committed(&self, topic_partition: &TopicPartition) -> Option<u64> {
        self.committer.committed(topic_partition)
    }

    /// Commits `offsets` for the subscription's group. Each offset is the next offset to
    /// consume.
    pub async fn commit(&self, offsets: &[(TopicPartition, u64)]) -> Result<()> {
        self.committer.commit(offsets).await
    }
}

impl<C: Connector> Clone for Subscription<C> {
    fn clone(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            assignment: self.assignment.clone(),
            committer: self.committer.clone(),
        }
    }
}

impl<C: Connector> std::fmt::Debug for Subscription<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("group_id", &self.group_id())
            .field("assignment", &self.assignment)
            .finish()
    }
}

struct PendingLoop<C: Connector> {
    consumer: Consumer<C>,
    handler: Arc<dyn Handler>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

struct Loops<C: Connector> {
    started: bool,
    pending: Vec<PendingLoop<C>>,
    running: Vec<JoinHandle<Result<()>>>,
}

pub struct DeliveryCoordinator<C: Connector> {
    config: Config,
    connections: Arc<ConnectionManager<C>>,
    producer: Arc<Producer<C>>,

    loops: Mutex<Loops<C>>,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    stop_result: OnceCell<Result<()>>,
}

impl<C: Connector> DeliveryCoordinator<C> {
    /// Validates `config`, connects to the cluster and creates the shared producer. An invalid
    /// configuration fails before any connection is attempted.
    #[instrument(skip_all)]
    pub async fn new(config: Config, connector: C) -> Result<Self> {
        config.validate()?;

        let connections = ConnectionManager::connect(connector, config.connection.clone()).await?;
        let producer = Arc::new(Producer::new(connections.clone(), config.producer.clone()));

        info!("delivery coordinator ready");

        Ok(Self {
            config,
            connections,
            producer,
            loops: Mutex::new(Loops {
                started: false,
                pending: Vec::new(),
                running: Vec::new(),
            }),
            shutdown: watch::channel(false).0,
            stopped: AtomicBool::new(false),
            stop_result: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionManager<C>> {
        &self.connections
    }

    pub fn producer(&self) -> &Arc<Producer<C>> {
        &self.producer
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn loops(&self) -> MutexGuard<'_, Loops<C>> {
        match self.loops.lock() {
            Ok(loops) => loops,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Dead-letter sink republishing to `<topic>.dlq` through this coordinator's producer.
    pub fn topic_dead_letters(&self) -> Arc<dyn DeadLetterSink> {
        Arc::new(TopicDeadLetterSink::new(self.producer.clone()))
    }

    /// Publishes a record. Waits up to `max_block` for buffer space when the target partition
    /// is full; the returned future resolves once the record is acknowledged or failed.
    pub async fn publish(
        &self,
        topic: &str,
        key: Option<Bytes>,
        payload: impl Into<Bytes>,
    ) -> Result<DeliveryFuture> {
        self.publish_record(Record::new(topic, key, payload)).await
    }

    pub async fn publish_record(&self, mut record: Record) -> Result<DeliveryFuture> {
        if self.is_stopped() {
            return Err(Error::stopped("coordinator is stopped"));
        }

        let deadline = Instant::now() + self.config.producer.max_block();
        let mut space_freed = self.producer.space_freed();

        loop {
            let _ = space_freed.borrow_and_update();

            record = match self.producer.try_publish(record).await? {
                Admission::Accepted(delivery) => return Ok(delivery),
                Admission::Full(record) => record,
            };

            debug!(topic = %record.topic, "partition full, waiting for buffer space");

            match tokio::time::timeout_at(deadline, space_freed.changed()).await {
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return Err(Error::stopped("producer dropped")),
                Err(_) => {
                    return Err(Error::timed_out(format!(
                        "no buffer space for {} within {:?}",
                        record.topic,
                        self.config.producer.max_block()
                    )))
                }
            }
        }
    }

    /// Registers `handler` for `topic` under `group_id`. The consumer starts at the group's
    /// committed offsets; its polling loop runs once the coordinator is started.
    #[instrument(skip(self, handler, options))]
    pub async fn subscribe<H: Handler>(
        &self,
        topic: &str,
        group_id: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Subscription<C>> {
        if self.is_stopped() {
            return Err(Error::stopped("coordinator is stopped"));
        }

        let mut config = self.config.consumer.clone();
        if let Some(commit_mode) = options.commit_mode {
            config.commit_mode = commit_mode;
        }

        let consumer = match options.partitions {
            Some(partitions) => {
                let partitions = partitions
                    .into_iter()
                    .map(|partition| TopicPartition::new(topic, partition))
                    .collect();

                Consumer::assign(self.connections.clone(), group_id, partitions, config).await?
            }
            None => Consumer::subscribe(self.connections.clone(), topic, group_id, config).await?,
        };

        let subscription = Subscription {
            topic: topic.to_owned(),
            assignment: consumer.assignment(),
            committer: consumer.committer(),
        };

        let pending = PendingLoop {
            consumer,
            handler: Arc::new(handler),
            dead_letters: options
                .dead_letters
                .unwrap_or_else(|| Arc::new(LoggingDeadLetterSink)),
        };

        let mut loops = self.loops();

        if loops.started {
            let task = self.spawn_loop(pending);
            loops.running.push(task);
        } else {
            loops.pending.push(pending);
        }

        Ok(subscription)
    }

    fn spawn_loop(&self, pending: PendingLoop<C>) -> JoinHandle<Result<()>> {
        let PendingLoop {
            consumer,
            handler,
            dead_letters,
        } = pending;

        let span = info_span!("consumer_loop", group_id = consumer.group_id());

        tokio::spawn(
            consumer
                .run(handler, dead_letters, self.shutdown.subscribe())
                .instrument(span),
        )
    }

    /// Starts the polling loops of every subscription. Subscriptions added later start
    /// immediately. Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::stopped("coordinator is stopped"));
        }

        let mut loops = self.loops();

        if loops.started {
            return Ok(());
        }

        loops.started = true;

        let pending = std::mem::take(&mut loops.pending);
        info!(subscriptions = pending.len(), "starting consumer loops");

        for pending in pending {
            let task = self.spawn_loop(pending);
            loops.running.push(task);
        }

        Ok(())
    }

    /// Commits `offsets` on behalf of `subscription`.
    pub async fn commit(
        &self,
        subscription: &Subscription<C>,
        offsets: &[(TopicPartition, u64)],
    ) -> Result<()> {
        subscription.commit(offsets).await
    }

    /// Stops every consumer loop, drains the producer and closes all connections, all within
    /// `timeout`. Every outstanding delivery future is resolved when this returns. Returns the
    /// first failure encountered along the way.
    ///
    /// Idempotent: concurrent and later calls wait for the first stop to finish and return its
    /// result.
    #[instrument(skip(self))]
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.stop_result
            .get_or_init(|| self.drain(timeout))
            .await
            .clone()
    }

    async fn drain(&self, timeout: Duration) -> Result<()> {
        self.stopped.store(true, Ordering::Release);

        info!("stopping delivery coordinator");

        let deadline = Instant::now() + timeout;
        self.shutdown.send_replace(true);

        let (pending, running) = {
            let mut loops = self.loops();
            (
                std::mem::take(&mut loops.pending),
                std::mem::take(&mut loops.running),
            )
        };

        // never started: nothing was delivered, so nothing to commit
        drop(pending);

        let mut first_err = None;

        for mut task in running {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => {
                    warn!(error = %err, "consumer loop stopped with error");
                    first_err.get_or_insert(err);
                }
                Ok(Err(err)) => {
                    error!(error = %err, "consumer loop panicked");
                    first_err.get_or_insert(Error::stopped(format!("consumer loop failed: {}", err)));
                }
                Err(_) => {
                    warn!("consumer loop did not stop in time, aborting");
                    task.abort();
                    first_err.get_or_insert(Error::timed_out("consumer loop did not stop in time"));
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());

        if let Err(err) = self.producer.close(remaining).await {
            first_err.get_or_insert(err);
        }

        self.connections.close();

        info!("delivery coordinator stopped");

        first_err.map_or(Ok(()), Err)
    }
}

impl<C: Connector> Drop for DeliveryCoordinator<C> {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}
