//! Module providing the per-partition record accumulator.
//!
//! Records are queued per partition until a batch is ready: the queue holds at least
//! `max_batch_bytes`, the oldest queued record has lingered for `linger`, or a flush is forced.
//! At most one batch per partition is in flight at any time, which keeps batches of a partition
//! in submission order across retries. Bytes are accounted from append until the batch carrying
//! them is resolved, bounding each partition to `max_pending_bytes`.

use super::{
    super::{
        error::Result,
        protocol::{ProducedRecord, TopicPartition},
    },
    Ack,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::{oneshot, watch},
    time::Instant,
};

pub(crate) struct PendingRecord {
    pub(crate) record: ProducedRecord,
    pub(crate) size: usize,
    pub(crate) enqueued_at: Instant,
    pub(crate) ack_tx: oneshot::Sender<Result<Ack>>,
}

/// A set of records sent together for one partition.
pub(crate) struct Batch {
    pub(crate) topic_partition: TopicPartition,
    pub(crate) base_sequence: u64,
    pub(crate) records: Vec<PendingRecord>,
    pub(crate) bytes: usize,
}

#[derive(Default)]
struct PartitionBuffer {
    queued: VecDeque<PendingRecord>,
    queued_bytes: usize,
    in_flight_bytes: usize,
    in_flight: bool,
    next_sequence: u64,
}

impl PartitionBuffer {
    fn pending_bytes(&self) -> usize {
        self.queued_bytes + self.in_flight_bytes
    }
}

/// Outcome of an append that was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Appended {
    /// The partition already had queued records.
    Queued,
    /// First queued record of the partition; a linger deadline starts.
    First,
    /// The queue reached `max_batch_bytes`.
    BatchFull,
}

/// Why an append was not admitted.
pub(crate) enum Rejected {
    /// The partition is at `max_pending_bytes`; the record and its channel are handed back.
    Full(ProducedRecord, oneshot::Sender<Result<Ack>>),
    /// The accumulator was closed by [`Accumulator::take_queued`].
    Closed,
}

#[derive(Default)]
struct Buffers {
    partitions: HashMap<TopicPartition, PartitionBuffer>,
    closed: bool,
}

pub(crate) struct Accumulator {
    buffers: Mutex<Buffers>,

    max_batch_bytes: usize,
    max_pending_bytes: usize,
    linger: Duration,

    space_freed: watch::Sender<u64>,
}

impl Accumulator {
    pub(crate) fn new(max_batch_bytes: usize, max_pending_bytes: usize, linger: Duration) -> Self {
        Self {
            buffers: Mutex::new(Buffers::default()),
            max_batch_bytes,
            max_pending_bytes,
            linger,
            space_freed: watch::channel(0).0,
        }
    }

    fn buffers(&self) -> MutexGuard<'_, Buffers> {
        match self.buffers.lock() {
            Ok(buffers) => buffers,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queues `record` unless the accumulator is closed or the append would exceed
    /// `max_pending_bytes` for the partition.
    pub(crate) fn try_append(
        &self,
        topic_partition: &TopicPartition,
        record: ProducedRecord,
        ack_tx: oneshot::Sender<Result<Ack>>,
    ) -> std::result::Result<Appended, Rejected> {
        let size = record.size();
        let mut buffers = self.buffers();

        if buffers.closed {
            return Err(Rejected::Closed);
        }

        let buffer = buffers.partitions.entry(topic_partition.clone()).or_default();

        if buffer.pending_bytes() + size > self.max_pending_bytes {
            return Err(Rejected::Full(record, ack_tx));
        }

        let first = buffer.queued.is_empty();

        buffer.queued.push_back(PendingRecord {
            record,
            size,
            enqueued_at: Instant::now(),
            ack_tx,
        });
        buffer.queued_bytes += size;

        Ok(if buffer.queued_bytes >= self.max_batch_bytes {
            Appended::BatchFull
        } else if first {
            Appended::First
        } else {
            Appended::Queued
        })
    }

    /// Takes one batch from every partition that is ready and has nothing in flight. Also
    /// returns the earliest linger deadline among partitions that are not ready yet.
    pub(crate) fn drain_ready(&self, now: Instant, force: bool) -> (Vec<Batch>, Option<Instant>) {
        let mut buffers = self.buffers();

        let mut batches = Vec::new();
        let mut next_deadline: Option<Instant> = None;

        for (topic_partition, buffer) in buffers.partitions.iter_mut() {
            if buffer.in_flight {
                continue;
            }

            let Some(oldest) = buffer.queued.front() else {
                continue;
            };

            let deadline = oldest.enqueued_at + self.linger;

            if !(force || buffer.queued_bytes >= self.max_batch_bytes || now >= deadline) {
                next_deadline = Some(next_deadline.map_or(deadline, |x| x.min(deadline)));
                continue;
            }

            let mut records = Vec::new();
            let mut bytes = 0;

            while let Some(record) = buffer.queued.front() {
                if !records.is_empty() && bytes + record.size > self.max_batch_bytes {
                    break;
                }

                bytes += record.size;

                if let Some(record) = buffer.queued.pop_front() {
                    records.push(record);
                }
            }

            let base_sequence = buffer.next_sequence;

            buffer.next_sequence += records.len() as u64;
            buffer.queued_bytes -= bytes;
            buffer.in_flight_bytes = bytes;
            buffer.in_flight = true;

            batches.push(Batch {
                topic_partition: topic_partition.clone(),
                base_sequence,
                records,
                bytes,
            });
        }

        (batches, next_deadline)
    }

    /// Marks the in-flight batch of `topic_partition` as resolved.
    pub(crate) fn complete(&self, topic_partition: &TopicPartition) {
        if let Some(buffer) = self.buffers().partitions.get_mut(topic_partition) {
            buffer.in_flight = false;
            buffer.in_flight_bytes = 0;
        }

        self.space_freed.send_modify(|x| *x += 1);
    }

    /// Closes the accumulator and removes every queued record, returning them for resolution.
    /// Later appends are rejected with [`Rejected::Closed`].
    pub(crate) fn take_queued(&self) -> Vec<PendingRecord> {
        let queued: Vec<_> = {
            let mut buffers = self.buffers();
            buffers.closed = true;

            buffers
                .partitions
                .values_mut()
                .flat_map(|buffer| {
                    buffer.queued_bytes = 0;
                    std::mem::take(&mut buffer.queued)
                })
                .collect()
        };

        self.space_freed.send_modify(|x| *x += 1);

        queued
    }

    /// Forgets in-flight accounting for batches that were abandoned.
    pub(crate) fn clear_in_flight(&self) {
        for buffer in self.buffers().partitions.values_mut() {
            buffer.in_flight = false;
            buffer.in_flight_bytes = 0;
        }

        self.space_freed.send_modify(|x| *x += 1);
    }

    pub(crate) fn pending_bytes(&self, topic_partition: &TopicPartition) -> usize {
        self.buffers()
            .partitions
            .get(topic_partition)
            .map_or(0, |x| x.pending_bytes())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffers()
            .partitions
            .values()
            .all(|x| x.queued.is_empty() && !x.in_flight)
    }

    /// Receiver notified whenever buffered bytes are released.
    pub(crate) fn space_freed(&self) -> watch::Receiver<u64> {
        self.space_freed.subscribe()
    }

    pub(crate) fn max_pending_bytes(&self) -> usize {
        self.max_pending_bytes
    }
}
