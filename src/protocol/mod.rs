//! Module providing the request/response messages exchanged with broker nodes.
//!
//! Messages are encoded with [`BinCode`] and carried inside [`frame::Frame`]s. Every request
//! receives exactly one response frame bearing the same correlation id.

use super::{
    common::serde_compat::{bincode::BinCode, SerializationProvider},
    error::{Error, ErrorKind, Result},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub mod frame;

pub type NodeId = u32;

/// Fixed per-record overhead used when accounting buffered bytes.
pub const RECORD_OVERHEAD: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerNode {
    pub id: NodeId,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub partition: u32,
    pub leader: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub topic: String,
    pub partitions: Vec<PartitionMetadata>,
}

/// Wire form of a record sent by a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedRecord {
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub timestamp_ms: u64,
}

impl ProducedRecord {
    pub fn size(&self) -> usize {
        record_size(self.key.as_ref(), &self.payload)
    }
}

/// Wire form of a record returned by a fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub offset: u64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub timestamp_ms: u64,
}

impl StoredRecord {
    pub fn size(&self) -> usize {
        record_size(self.key.as_ref(), &self.payload)
    }
}

#[inline]
pub fn record_size(key: Option<&Bytes>, payload: &Bytes) -> usize {
    key.map_or(0, |x| x.len()) + payload.len() + RECORD_OVERHEAD
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Metadata {
        topics: Vec<String>,
    },
    Produce {
        topic_partition: TopicPartition,
        producer_id: u64,
        base_sequence: u64,
        records: Vec<ProducedRecord>,
    },
    Fetch {
        topic_partition: TopicPartition,
        offset: u64,
        max_bytes: u64,
        max_wait_ms: u64,
    },
    OffsetCommit {
        group_id: String,
        offsets: Vec<(TopicPartition, u64)>,
    },
    OffsetFetch {
        group_id: String,
        partitions: Vec<TopicPartition>,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Metadata { topics: _ } => "metadata",
            Request::Produce { .. } => "produce",
            Request::Fetch { .. } => "fetch",
            Request::OffsetCommit { .. } => "offset_commit",
            Request::OffsetFetch { .. } => "offset_fetch",
        }
    }

    /// Encodes the request, rejecting requests that would not fit in a single frame.
    pub fn encode(&self) -> Result<Bytes> {
        let size = BinCode::serialized_size(self)?;

        if size > frame::MAX_FRAME_LENGTH as usize {
            return Err(Error::new(
                ErrorKind::RecordTooLarge,
                format!(
                    "{} request of {} bytes exceeds frame limit {}",
                    self.name(),
                    size,
                    frame::MAX_FRAME_LENGTH
                ),
            ));
        }

        BinCode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        BinCode::deserialize(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Leader election in progress.
    LeaderNotAvailable,
    /// The receiving broker does not lead the partition.
    NotLeaderForPartition,
    UnknownTopicOrPartition,
    /// The broker could not decode the request.
    CorruptMessage,
}

impl ErrorCode {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorCode::LeaderNotAvailable => ErrorKind::Retriable,
            ErrorCode::NotLeaderForPartition | ErrorCode::UnknownTopicOrPartition => {
                ErrorKind::StaleMetadata
            }
            ErrorCode::CorruptMessage => ErrorKind::Protocol,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Metadata {
        brokers: Vec<BrokerNode>,
        topics: Vec<TopicMetadata>,
    },
    Produced {
        base_offset: u64,
    },
    Fetched {
        records: Vec<StoredRecord>,
        high_watermark: u64,
    },
    OffsetCommitted,
    OffsetFetched {
        offsets: Vec<(TopicPartition, Option<u64>)>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Converts an error response into the corresponding [`Error`].
    pub fn into_result(self) -> Result<Self> {
        match self {
            Response::Error { code, message } => Err(Error::new(code.kind(), message)),
            response => Ok(response),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        BinCode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        BinCode::deserialize(bytes)
    }
}

/// Builds the error returned when a response variant does not match the request sent.
pub fn unexpected_response(request: &str, response: &Response) -> Error {
    Error::protocol(format!(
        "unexpected response to {} request: {:?}",
        request, response
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding() {
        let request = Request::Produce {
            topic_partition: TopicPartition::new("orders", 3),
            producer_id: 7,
            base_sequence: 42,
            records: vec![ProducedRecord {
                key: Some(Bytes::from_static(b"user-1")),
                payload: Bytes::from_static(b"created"),
                timestamp_ms: 1_700_000_000_000,
            }],
        };

        let bytes = request.encode().unwrap();
        assert_eq!(Request::decode(&bytes).unwrap(), request);
        assert_eq!(request.name(), "produce");

        assert_eq!(
            Request::decode(&bytes[..bytes.len() / 2])
                .unwrap_err()
                .kind(),
            ErrorKind::Protocol
        );
    }

    #[test]
    fn test_oversized_request_is_rejected() {
        let request = Request::Produce {
            topic_partition: TopicPartition::new("orders", 0),
            producer_id: 7,
            base_sequence: 0,
            records: vec![ProducedRecord {
                key: None,
                payload: Bytes::from(vec![0; frame::MAX_FRAME_LENGTH as usize]),
                timestamp_ms: 0,
            }],
        };

        assert_eq!(
            request.encode().unwrap_err().kind(),
            ErrorKind::RecordTooLarge
        );
    }

    #[test]
    fn test_error_response_classification() {
        assert_eq!(
            Response::error(ErrorCode::LeaderNotAvailable, "election")
                .into_result()
                .unwrap_err()
                .kind(),
            ErrorKind::Retriable
        );
        assert_eq!(
            Response::error(ErrorCode::NotLeaderForPartition, "moved")
                .into_result()
                .unwrap_err()
                .kind(),
            ErrorKind::StaleMetadata
        );
        assert_eq!(
            Response::OffsetCommitted.into_result().unwrap(),
            Response::OffsetCommitted
        );
    }

    #[test]
    fn test_record_size_accounting() {
        let record = ProducedRecord {
            key: None,
            payload: Bytes::from_static(b"12345"),
            timestamp_ms: 0,
        };

        assert_eq!(record.size(), 5 + RECORD_OVERHEAD);
        assert_eq!(TopicPartition::new("orders", 1).to_string(), "orders-1");
    }
}
