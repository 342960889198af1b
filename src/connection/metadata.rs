//! Module providing a client side view of cluster metadata.

use super::super::protocol::{BrokerNode, NodeId, PartitionMetadata, TopicMetadata, TopicPartition};
use std::{collections::HashMap, time::Instant};

/// Partition leadership and broker addresses as last reported by the cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterMetadata {
    brokers: HashMap<NodeId, String>,
    topics: HashMap<String, Vec<PartitionMetadata>>,
    refreshed_at: Option<Instant>,
}

impl ClusterMetadata {
    /// Merges a metadata response. Brokers are replaced wholesale while topics are updated
    /// individually, so that a refresh scoped to one topic keeps the others.
    pub fn update(&mut self, brokers: Vec<BrokerNode>, topics: Vec<TopicMetadata>) {
        self.brokers = brokers.into_iter().map(|x| (x.id, x.address)).collect();

        for TopicMetadata {
            topic,
            mut partitions,
        } in topics
        {
            partitions.sort_by_key(|x| x.partition);
            self.topics.insert(topic, partitions);
        }

        self.refreshed_at = Some(Instant::now());
    }

    pub fn broker_address(&self, node: NodeId) -> Option<&str> {
        self.brokers.get(&node).map(|x| x.as_str())
    }

    pub fn broker_addresses(&self) -> Vec<String> {
        let mut nodes: Vec<_> = self.brokers.iter().collect();
        nodes.sort_by_key(|(id, _)| **id);
        nodes.into_iter().map(|(_, address)| address.clone()).collect()
    }

    pub fn partition_count(&self, topic: &str) -> Option<u32> {
        self.topics
            .get(topic)
            .filter(|x| !x.is_empty())
            .map(|x| x.len() as u32)
    }

    pub fn leader(&self, topic_partition: &TopicPartition) -> Option<NodeId> {
        self.topics
            .get(&topic_partition.topic)?
            .iter()
            .find(|x| x.partition == topic_partition.partition)
            .map(|x| x.leader)
    }

    pub fn leader_address(&self, topic_partition: &TopicPartition) -> Option<&str> {
        self.leader(topic_partition)
            .and_then(|node| self.broker_address(node))
    }

    /// Broker responsible for consumer group offsets: the lowest numbered node.
    pub fn coordinator_address(&self) -> Option<&str> {
        self.brokers
            .iter()
            .min_by_key(|(id, _)| **id)
            .map(|(_, address)| address.as_str())
    }

    pub fn refreshed_at(&self) -> Option<Instant> {
        self.refreshed_at
    }
}
