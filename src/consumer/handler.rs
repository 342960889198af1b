//! Module providing the record handler seam and the dead-letter sinks for records that
//! exhausted their redeliveries.

use super::super::{
    connection::Connector,
    error::{Error, ErrorKind, Result},
    producer::{Admission, Producer},
    record::ConsumerRecord,
};
use async_trait::async_trait;
use std::{future::Future, sync::Arc};
use tokio::sync::mpsc;
use tracing::error;

/// Processes delivered records. An `Err` marks the record as failed; it is redelivered after the
/// configured delay until the redelivery limit is reached.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, record: &ConsumerRecord) -> Result<()>;
}

/// [`Handler`] backed by an async closure.
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ConsumerRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(ConsumerRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, record: &ConsumerRecord) -> Result<()> {
        (self.0)(record.clone()).await
    }
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, record: &ConsumerRecord) -> Result<()> {
        (**self).handle(record).await
    }
}

/// A record that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub record: ConsumerRecord,
    pub reason: String,
}

/// Receives records whose redeliveries are exhausted. A failing sink leaves the record
/// unprocessed; it is handed to the sink again on its next delivery.
#[async_trait]
pub trait DeadLetterSink: Send + Sync + 'static {
    async fn send(&self, dead_letter: DeadLetter) -> Result<()>;
}

/// Logs dead letters and drops them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LoggingDeadLetterSink {
    async fn send(&self, dead_letter: DeadLetter) -> Result<()> {
        let DeadLetter { record, reason } = dead_letter;

        error!(
            topic_partition = %record.topic_partition,
            offset = record.offset,
            reason,
            "dropping undeliverable record"
        );

        Ok(())
    }
}

/// Forwards dead letters to an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelDeadLetterSink {
    tx: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DeadLetterSink for ChannelDeadLetterSink {
    async fn send(&self, dead_letter: DeadLetter) -> Result<()> {
        self.tx
            .send(dead_letter)
            .map_err(|_| Error::stopped("dead letter receiver dropped"))
    }
}

pub const DEAD_LETTER_TOPIC_SUFFIX: &str = ".dlq";

/// Republishes dead letters to `<topic><suffix>` and waits for the acknowledgement.
pub struct TopicDeadLetterSink<C: Connector> {
    producer: Arc<Producer<C>>,
    suffix: String,
}

impl<C: Connector> TopicDeadLetterSink<C> {
    pub fn new(producer: Arc<Producer<C>>) -> Self {
        Self::with_suffix(producer, DEAD_LETTER_TOPIC_SUFFIX)
    }

    pub fn with_suffix(producer: Arc<Producer<C>>, suffix: impl Into<String>) -> Self {
        Self {
            producer,
            suffix: suffix.into(),
        }
    }

    pub fn topic_for(&self, record: &ConsumerRecord) -> String {
        format!("{}{}", record.topic_partition.topic, self.suffix)
    }
}

#[async_trait]
impl<C: Connector> DeadLetterSink for TopicDeadLetterSink<C> {
    async fn send(&self, dead_letter: DeadLetter) -> Result<()> {
        let topic = self.topic_for(&dead_letter.record);

        match self
            .producer
            .try_publish(dead_letter.record.republish_to(topic.as_str()))
            .await?
        {
            Admission::Accepted(delivery) => delivery.await.map(|_| ()),
            Admission::Full(_) => Err(Error::new(
                ErrorKind::Retriable,
                format!("dead letter topic {} is full", topic),
            )),
        }
    }
}

#[async_trait]
impl<S: DeadLetterSink + ?Sized> DeadLetterSink for Arc<S> {
    async fn send(&self, dead_letter: DeadLetter) -> Result<()> {
        (**self).send(dead_letter).await
    }
}
