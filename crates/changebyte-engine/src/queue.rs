//! Partitioned durable queue adapter.
//!
//! Envelopes are published to the partition derived from their source id and
//! consumed in offset order. A partition's committed offset only advances once
//! an envelope reached a terminal state, so anything processed but not
//! committed is redelivered after a restart (at-least-once).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use changebyte_types::envelope::Envelope;
use changebyte_types::error::{RelayError, Stage};

use crate::blocking;

/// One envelope read from a partition at `offset`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub offset: u64,
    pub envelope: Envelope,
}

/// Broker contract. Calls may block; callers run them off the async runtime.
pub trait DurableQueue: Send + Sync {
    fn partitions(&self) -> u32;

    /// Append to `envelope.partition`. Returns the assigned offset.
    ///
    /// # Errors
    ///
    /// Returns a retryable publish error when the broker cannot accept the
    /// envelope.
    fn publish(&self, envelope: &Envelope) -> Result<u64, RelayError>;

    /// Read up to `max` envelopes starting at `from_offset`.
    ///
    /// # Errors
    ///
    /// Returns a retryable error when the broker is unreachable.
    fn poll(&self, partition: u32, from_offset: u64, max: usize) -> Result<Vec<Delivery>, RelayError>;

    /// Record that every offset below `next_offset` is done.
    ///
    /// # Errors
    ///
    /// Returns a retryable error when the broker is unreachable.
    fn commit(&self, partition: u32, next_offset: u64) -> Result<(), RelayError>;

    /// Next offset to consume after a restart.
    ///
    /// # Errors
    ///
    /// Returns a retryable error when the broker is unreachable.
    fn committed(&self, partition: u32) -> Result<u64, RelayError>;
}

#[derive(Debug, Default)]
struct PartitionLog {
    entries: Vec<Envelope>,
    committed: u64,
}

/// In-process queue backing `memory://` broker endpoints.
#[derive(Debug)]
pub struct MemoryQueue {
    logs: Mutex<Vec<PartitionLog>>,
    failing_publishes: AtomicU32,
    failing_commits: AtomicU32,
}

impl MemoryQueue {
    #[must_use]
    pub fn new(partitions: u32) -> Self {
        let logs = (0..partitions.max(1)).map(|_| PartitionLog::default()).collect();
        Self {
            logs: Mutex::new(logs),
            failing_publishes: AtomicU32::new(0),
            failing_commits: AtomicU32::new(0),
        }
    }

    /// Make the next `count` publishes fail with a retryable error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` commits fail with a retryable error.
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Envelopes appended to `partition` so far.
    #[must_use]
    pub fn len(&self, partition: u32) -> usize {
        self.logs
            .lock()
            .ok()
            .and_then(|logs| logs.get(partition as usize).map(|log| log.entries.len()))
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        (0..self.partitions()).all(|p| self.len(p) == 0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<PartitionLog>>, RelayError> {
        self.logs
            .lock()
            .map_err(|_| RelayError::publish("QUEUE_POISONED", "memory queue lock poisoned"))
    }
}

fn unknown_partition(partition: u32) -> RelayError {
    RelayError::publish(
        "UNKNOWN_PARTITION",
        format!("partition {partition} does not exist"),
    )
}

impl DurableQueue for MemoryQueue {
    fn partitions(&self) -> u32 {
        self.logs
            .lock()
            .map_or(0, |logs| u32::try_from(logs.len()).unwrap_or(u32::MAX))
    }

    fn publish(&self, envelope: &Envelope) -> Result<u64, RelayError> {
        let remaining = self.failing_publishes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_publishes.store(remaining - 1, Ordering::SeqCst);
            return Err(RelayError::publish(
                "BROKER_UNAVAILABLE",
                "injected publish failure",
            ));
        }
        let mut logs = self.lock()?;
        let log = logs
            .get_mut(envelope.partition as usize)
            .ok_or_else(|| unknown_partition(envelope.partition))?;
        log.entries.push(envelope.clone());
        Ok(log.entries.len() as u64 - 1)
    }

    fn poll(&self, partition: u32, from_offset: u64, max: usize) -> Result<Vec<Delivery>, RelayError> {
        let logs = self.lock()?;
        let log = logs
            .get(partition as usize)
            .ok_or_else(|| unknown_partition(partition))?;
        let start = usize::try_from(from_offset).unwrap_or(usize::MAX);
        Ok(log
            .entries
            .iter()
            .enumerate()
            .skip(start)
            .take(max)
            .map(|(offset, envelope)| Delivery {
                offset: offset as u64,
                envelope: envelope.clone(),
            })
            .collect())
    }

    fn commit(&self, partition: u32, next_offset: u64) -> Result<(), RelayError> {
        let remaining = self.failing_commits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_commits.store(remaining - 1, Ordering::SeqCst);
            return Err(RelayError::publish("BROKER_UNAVAILABLE", "injected commit failure"));
        }
        let mut logs = self.lock()?;
        let log = logs
            .get_mut(partition as usize)
            .ok_or_else(|| unknown_partition(partition))?;
        log.committed = log.committed.max(next_offset);
        Ok(())
    }

    fn committed(&self, partition: u32) -> Result<u64, RelayError> {
        let logs = self.lock()?;
        logs.get(partition as usize)
            .map(|log| log.committed)
            .ok_or_else(|| unknown_partition(partition))
    }
}

/// Lazy, restartable cursor over one partition.
///
/// Fetches a batch only when the local buffer runs dry. Returning `None`
/// means "caught up for now", not end of stream. [`QueueConsumer::rewind`]
/// restarts from the committed offset, which replays anything delivered but
/// never committed.
pub struct QueueConsumer {
    queue: Arc<dyn DurableQueue>,
    partition: u32,
    next_offset: u64,
    buffer: VecDeque<Delivery>,
    batch_size: usize,
    deadline: Duration,
}

impl QueueConsumer {
    /// Open a cursor positioned at the partition's committed offset.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the committed offset cannot be read.
    pub async fn open(
        queue: Arc<dyn DurableQueue>,
        partition: u32,
        batch_size: usize,
        deadline: Duration,
    ) -> Result<Self, RelayError> {
        let mut consumer = Self {
            queue,
            partition,
            next_offset: 0,
            buffer: VecDeque::new(),
            batch_size: batch_size.max(1),
            deadline,
        };
        consumer.rewind().await?;
        Ok(consumer)
    }

    #[must_use]
    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Drop buffered deliveries and restart from the committed offset.
    ///
    /// # Errors
    ///
    /// Returns the broker error if the committed offset cannot be read.
    pub async fn rewind(&mut self) -> Result<(), RelayError> {
        let queue = Arc::clone(&self.queue);
        let partition = self.partition;
        let committed =
            blocking::call(Stage::Queue, self.deadline, move || queue.committed(partition))
                .await?;
        self.buffer.clear();
        self.next_offset = committed;
        Ok(())
    }

    /// Next delivery, fetching a batch if the buffer is empty.
    ///
    /// # Errors
    ///
    /// Returns the broker error from the fetch; the cursor is unchanged and
    /// the call can be repeated.
    pub async fn next_delivery(&mut self) -> Result<Option<Delivery>, RelayError> {
        if self.buffer.is_empty() {
            let queue = Arc::clone(&self.queue);
            let (partition, from, max) = (self.partition, self.next_offset, self.batch_size);
            let batch =
                blocking::call(Stage::Queue, self.deadline, move || queue.poll(partition, from, max))
                    .await?;
            if let Some(last) = batch.last() {
                self.next_offset = last.offset + 1;
            }
            self.buffer.extend(batch);
        }
        Ok(self.buffer.pop_front())
    }

    /// Commit everything up to and including `offset`.
    ///
    /// # Errors
    ///
    /// Returns the broker error; the envelope will then be redelivered.
    pub async fn commit(&self, offset: u64) -> Result<(), RelayError> {
        let queue = Arc::clone(&self.queue);
        let partition = self.partition;
        blocking::call(Stage::Queue, self.deadline, move || {
            queue.commit(partition, offset + 1)
        })
        .await
    }
}
