//! Module providing the records exchanged through the pipe.

use super::protocol::{record_size, ProducedRecord, StoredRecord, TopicPartition};
use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

/// A record submitted for publishing. The key, when present, selects the partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub timestamp_ms: u64,
}

impl Record {
    pub fn new(topic: impl Into<String>, key: Option<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key,
            payload: payload.into(),
            timestamp_ms: now_ms(),
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Bytes accounted against buffer limits for this record.
    pub fn size(&self) -> usize {
        record_size(self.key.as_ref(), &self.payload)
    }

    pub(crate) fn into_produced(self) -> (String, ProducedRecord) {
        (
            self.topic,
            ProducedRecord {
                key: self.key,
                payload: self.payload,
                timestamp_ms: self.timestamp_ms,
            },
        )
    }

    pub(crate) fn from_produced(topic: String, record: ProducedRecord) -> Self {
        Self {
            topic,
            key: record.key,
            payload: record.payload,
            timestamp_ms: record.timestamp_ms,
        }
    }
}

/// A record delivered to consumers, positioned within its partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic_partition: TopicPartition,
    pub offset: u64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub timestamp_ms: u64,
}

impl ConsumerRecord {
    pub(crate) fn from_stored(topic_partition: TopicPartition, record: StoredRecord) -> Self {
        Self {
            topic_partition,
            offset: record.offset,
            key: record.key,
            payload: record.payload,
            timestamp_ms: record.timestamp_ms,
        }
    }

    pub fn size(&self) -> usize {
        record_size(self.key.as_ref(), &self.payload)
    }

    /// Converts this record into one publishable to `topic`, keeping key and timestamp.
    pub fn republish_to(&self, topic: impl Into<String>) -> Record {
        Record {
            topic: topic.into(),
            key: self.key.clone(),
            payload: self.payload.clone(),
            timestamp_ms: self.timestamp_ms,
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|x| x.as_millis() as u64)
        .unwrap_or_default()
}
