//! Module providing partition assignment for published records.

use std::{collections::HashMap, sync::Mutex};

/// Maps a record onto one of `partition_count` partitions of `topic`.
pub trait Partitioner: Send + Sync + 'static {
    fn partition(&self, topic: &str, key: Option<&[u8]>, partition_count: u32) -> u32;
}

/// Keyed records go to `crc32(key) % partition_count`; unkeyed records are spread round-robin
/// per topic.
#[derive(Debug, Default)]
pub struct DefaultPartitioner {
    counters: Mutex<HashMap<String, u32>>,
}

impl DefaultPartitioner {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_round_robin(&self, topic: &str) -> u32 {
        let mut counters = match self.counters.lock() {
            Ok(counters) => counters,
            Err(poisoned) => poisoned.into_inner(),
        };

        let counter = counters.entry(topic.to_owned()).or_insert(0);
        let current = *counter;
        *counter = counter.wrapping_add(1);

        current
    }
}

impl Partitioner for DefaultPartitioner {
    fn partition(&self, topic: &str, key: Option<&[u8]>, partition_count: u32) -> u32 {
        if partition_count == 0 {
            return 0;
        }

        match key {
            Some(key) => crc32fast::hash(key) % partition_count,
            None => self.next_round_robin(topic) % partition_count,
        }
    }
}
