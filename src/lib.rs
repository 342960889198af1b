//! An ordered, at-least-once publish/subscribe client core.
//!
//! The crate is organised around four components:
//! - [`connection`]: long-lived broker sessions, metadata discovery and reconnection
//! - [`producer`]: per-partition batching, acknowledgement tracking and retries
//! - [`consumer`]: long-poll fetching, ordered delivery, redelivery and offset commits
//! - [`coordinator`]: the entry point tying the above together with backpressure and graceful
//!   shutdown
//!
//! [`broker::in_memory`] provides a loopback broker speaking the same framed protocol, used by
//! tests and the demo binary.

pub mod broker;
pub mod common;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod producer;
pub mod protocol;
pub mod record;

pub mod prelude {
    //! Prelude module for [`laminarmq_client`](super) with common exports for convenience.

    pub use super::{
        config::{CommitMode, Config, ConnectionConfig, ConsumerConfig, ProducerConfig},
        connection::{tcp::TcpConnector, ConnectionManager, Connector},
        consumer::{
            handler_fn, ChannelDeadLetterSink, Consumer, DeadLetter, DeadLetterSink, Handler,
            LoggingDeadLetterSink, TopicDeadLetterSink,
        },
        coordinator::{DeliveryCoordinator, SubscribeOptions, Subscription},
        error::{Error, ErrorKind, Result},
        producer::{Ack, Admission, DeliveryFuture, Producer},
        protocol::TopicPartition,
        record::{ConsumerRecord, Record},
    };
}
