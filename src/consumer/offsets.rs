//! Module providing group offset bookkeeping: staged offsets awaiting commit and the last
//! offsets the coordinator acknowledged.

use super::super::{
    connection::{ConnectionManager, Connector},
    error::Result,
    protocol::{unexpected_response, Request, Response, TopicPartition},
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, instrument, warn};

#[derive(Default)]
struct Offsets {
    staged: BTreeMap<TopicPartition, u64>,
    committed: BTreeMap<TopicPartition, u64>,
}

/// Commits offsets of one consumer group. Shared between a polling loop and the handles that
/// commit manually, so every method takes `&self`.
pub struct OffsetCommitter<C: Connector> {
    connections: Arc<ConnectionManager<C>>,
    group_id: String,
    offsets: Mutex<Offsets>,
}

impl<C: Connector> OffsetCommitter<C> {
    pub fn new(connections: Arc<ConnectionManager<C>>, group_id: impl Into<String>) -> Self {
        Self {
            connections,
            group_id: group_id.into(),
            offsets: Mutex::new(Offsets::default()),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    fn offsets(&self) -> MutexGuard<'_, Offsets> {
        match self.offsets.lock() {
            Ok(offsets) => offsets,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reads the committed offsets of `partitions` from the coordinator. Partitions without a
    /// commit map to `None`.
    #[instrument(skip(self), fields(group_id = %self.group_id))]
    pub async fn fetch_committed(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<Vec<(TopicPartition, Option<u64>)>> {
        let request = Request::OffsetFetch {
            group_id: self.group_id.clone(),
            partitions: partitions.to_vec(),
        };

        let offsets = match self.connections.request_coordinator(&request).await? {
            Response::OffsetFetched { offsets } => offsets,
            response => return Err(unexpected_response(request.name(), &response)),
        };

        let mut state = self.offsets();
        for (topic_partition, offset) in &offsets {
            if let Some(offset) = offset {
                state.committed.insert(topic_partition.clone(), *offset);
            }
        }

        Ok(offsets)
    }

    /// Records `offset` as the next offset to commit for `topic_partition`.
    pub fn stage(&self, topic_partition: &TopicPartition, offset: u64) {
        let mut state = self.offsets();

        if state.committed.get(topic_partition) == Some(&offset) {
            state.staged.remove(topic_partition);
        } else {
            state.staged.insert(topic_partition.clone(), offset);
        }
    }

    pub fn has_staged(&self) -> bool {
        !self.offsets().staged.is_empty()
    }

    pub fn committed(&self, topic_partition: &TopicPartition) -> Option<u64> {
        self.offsets().committed.get(topic_partition).copied()
    }

    /// Stages `offsets` and commits everything staged. On failure the offsets stay staged for
    /// the next commit.
    pub async fn commit(&self, offsets: &[(TopicPartition, u64)]) -> Result<()> {
        for (topic_partition, offset) in offsets {
            self.stage(topic_partition, *offset);
        }

        self.commit_staged().await
    }

    /// Commits every staged offset.
    #[instrument(skip(self), fields(group_id = %self.group_id))]
    pub async fn commit_staged(&self) -> Result<()> {
        let offsets: Vec<_> = self
            .offsets()
            .staged
            .iter()
            .map(|(topic_partition, offset)| (topic_partition.clone(), *offset))
            .collect();

        if offsets.is_empty() {
            return Ok(());
        }

        let request = Request::OffsetCommit {
            group_id: self.group_id.clone(),
            offsets: offsets.clone(),
        };

        match self.connections.request_coordinator(&request).await {
            Ok(Response::OffsetCommitted) => {}
            Ok(response) => return Err(unexpected_response(request.name(), &response)),
            Err(err) => {
                warn!(error = %err, partitions = offsets.len(), "offset commit failed");
                return Err(err);
            }
        }

        let mut state = self.offsets();

        for (topic_partition, offset) in offsets {
            // a newer offset may have been staged while the commit was in flight
            if state.staged.get(&topic_partition) == Some(&offset) {
                state.staged.remove(&topic_partition);
            }

            debug!(%topic_partition, offset, "offset committed");
            state.committed.insert(topic_partition, offset);
        }

        Ok(())
    }
}

impl<C: Connector> std::fmt::Debug for OffsetCommitter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetCommitter")
            .field("group_id", &self.group_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        super::super::{
            broker::in_memory::{BrokerConfig, InMemoryBroker, InMemoryConnector},
            config::ConnectionConfig,
        },
        *,
    };

    #[tokio::test]
    async fn test_commit_and_fetch_committed() {
        let broker = InMemoryBroker::new(BrokerConfig::default());
        broker.create_topic("orders", 2);

        let connections = ConnectionManager::connect(
            InMemoryConnector::new(broker.clone()),
            ConnectionConfig {
                brokers: vec!["loopback:9092".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let committer = OffsetCommitter::new(connections.clone(), "billing");

        let (first, second) = (
            TopicPartition::new("orders", 0),
            TopicPartition::new("orders", 1),
        );

        let offsets = committer
            .fetch_committed(&[first.clone(), second.clone()])
            .await
            .unwrap();
        assert_eq!(offsets, vec![(first.clone(), None), (second.clone(), None)]);

        committer.stage(&first, 3);
        assert!(committer.has_staged());

        committer.commit(&[(second.clone(), 7)]).await.unwrap();
        assert!(!committer.has_staged());

        assert_eq!(committer.committed(&first), Some(3));
        assert_eq!(broker.committed_offset("billing", &first), Some(3));
        assert_eq!(broker.committed_offset("billing", &second), Some(7));

        // restaging the committed offset is a no-op
        committer.stage(&first, 3);
        assert!(!committer.has_staged());

        let other = OffsetCommitter::new(connections, "billing");
        assert_eq!(
            other.fetch_committed(&[second.clone()]).await.unwrap(),
            vec![(second.clone(), Some(7))]
        );
        assert_eq!(other.committed(&second), Some(7));
    }
}
