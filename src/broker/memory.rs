use crate::broker::{
    BrokerClient, FetchResult, IsolationLevel, OffsetCommit, ProducerId, TransactionOutcome,
};
use crate::error::BrokerError;
use crate::record::{ProducerRecord, Record, TopicPartition};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryStatus {
    /// Appended outside of a transaction
    Plain,
    /// Part of a transaction that has not ended yet
    Pending,
    Committed,
    Aborted,
}

#[derive(Debug)]
struct LogEntry {
    record: Record,
    status: EntryStatus,
}

#[derive(Debug, Default)]
struct PartitionLog {
    entries: Vec<LogEntry>,
    sealed: bool,
}

#[derive(Debug, Default)]
struct ProducerState {
    epoch: u32,
    /// Positions appended by the open transaction
    pending: Vec<(TopicPartition, i64)>,
    /// Sequence → position, for idempotent retries within the open transaction
    sequences: HashMap<u64, (u32, i64)>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<PartitionLog>>,
    group_offsets: HashMap<(String, TopicPartition), i64>,
    producers: HashMap<String, ProducerState>,
}

/// In-memory partitioned log with transactional appends
///
/// Offsets are dense and start at zero. Topics are created on first use with
/// the broker's default partition count. Transactional records are visible
/// to read-committed fetches only after their transaction commits; a pending
/// record blocks read-committed readers at its offset (the last stable
/// offset) until it is committed or aborted.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    default_partitions: u32,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_default_partitions(1)
    }

    pub fn with_default_partitions(partitions: u32) -> Self {
        debug!(partitions, "Initializing in-memory broker");
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            default_partitions: partitions.max(1),
        }
    }

    /// Create a topic with an explicit partition count; no-op if it exists
    pub fn create_topic(&self, topic: &str, partitions: u32) {
        let mut state = self.state.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| (0..partitions.max(1)).map(|_| PartitionLog::default()).collect());
    }

    /// Mark a partition as complete; readers see end-of-partition once drained
    pub fn seal(&self, tp: &TopicPartition) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let log = partition_mut(&mut state, tp)?;
        log.sealed = true;
        debug!(partition = %tp, "Sealed partition");
        Ok(())
    }

    /// Every record of a partition visible under the given isolation level
    pub fn read_all(
        &self,
        tp: &TopicPartition,
        isolation: IsolationLevel,
    ) -> Result<Vec<Record>, BrokerError> {
        let state = self.state.lock();
        let log = partition(&state, tp)?;
        Ok(scan(log, 0, usize::MAX, isolation).0)
    }

    /// Every committed record of a topic across all partitions
    pub fn read_topic(&self, topic: &str) -> Vec<Record> {
        let state = self.state.lock();
        state
            .topics
            .get(topic)
            .map(|logs| {
                logs.iter()
                    .flat_map(|log| scan(log, 0, usize::MAX, IsolationLevel::ReadCommitted).0)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn append_entry(
        &self,
        state: &mut BrokerState,
        record: ProducerRecord,
        status: EntryStatus,
    ) -> Result<(u32, i64), BrokerError> {
        let logs = state
            .topics
            .entry(record.topic.clone())
            .or_insert_with(|| {
                (0..self.default_partitions)
                    .map(|_| PartitionLog::default())
                    .collect()
            });

        let partition = match record.partition {
            Some(p) => p,
            None => key_partition(&record.key, logs.len() as u32),
        };
        let tp = TopicPartition::new(record.topic.clone(), partition);
        let log = logs
            .get_mut(partition as usize)
            .ok_or_else(|| BrokerError::UnknownPartition(tp.clone()))?;
        if log.sealed {
            return Err(BrokerError::Fatal(format!("Partition {} is sealed", tp)));
        }

        let offset = log.entries.len() as i64;
        log.entries.push(LogEntry {
            record: Record {
                key: record.key,
                value: record.value,
                headers: record.headers,
                topic: record.topic,
                partition,
                offset,
                timestamp: record.timestamp.unwrap_or_else(Utc::now),
            },
            status,
        });

        trace!(partition = %tp, offset, "Appended record");
        Ok((partition, offset))
    }
}

fn key_partition(key: &[u8], partitions: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(partitions.max(1))) as u32
}

fn partition<'a>(state: &'a BrokerState, tp: &TopicPartition) -> Result<&'a PartitionLog, BrokerError> {
    state
        .topics
        .get(&tp.topic)
        .and_then(|logs| logs.get(tp.partition as usize))
        .ok_or_else(|| BrokerError::UnknownPartition(tp.clone()))
}

fn partition_mut<'a>(
    state: &'a mut BrokerState,
    tp: &TopicPartition,
) -> Result<&'a mut PartitionLog, BrokerError> {
    state
        .topics
        .get_mut(&tp.topic)
        .and_then(|logs| logs.get_mut(tp.partition as usize))
        .ok_or_else(|| BrokerError::UnknownPartition(tp.clone()))
}

/// Returns the visible records and the index the scan stopped at
fn scan(
    log: &PartitionLog,
    offset: i64,
    max_records: usize,
    isolation: IsolationLevel,
) -> (Vec<Record>, usize) {
    let mut records = Vec::new();
    let mut index = offset.max(0) as usize;

    while index < log.entries.len() && records.len() < max_records {
        let entry = &log.entries[index];
        match (isolation, &entry.status) {
            (IsolationLevel::ReadCommitted, EntryStatus::Pending) => break,
            (IsolationLevel::ReadCommitted, EntryStatus::Aborted) => {}
            _ => records.push(entry.record.clone()),
        }
        index += 1;
    }

    (records, index)
}

fn check_epoch(state: &BrokerState, producer: &ProducerId) -> Result<(), BrokerError> {
    let current = state
        .producers
        .get(&producer.transactional_id)
        .ok_or_else(|| {
            BrokerError::InvalidTransactionState(format!(
                "Unknown transactional id {}",
                producer.transactional_id
            ))
        })?;

    if producer.epoch < current.epoch {
        return Err(BrokerError::Fenced {
            identity: producer.transactional_id.clone(),
            current: current.epoch,
            attempted: producer.epoch,
        });
    }
    if producer.epoch > current.epoch {
        return Err(BrokerError::InvalidTransactionState(format!(
            "Epoch {} was never issued for {}",
            producer.epoch, producer.transactional_id
        )));
    }
    Ok(())
}

fn finish_pending(state: &mut BrokerState, transactional_id: &str, status: EntryStatus) -> usize {
    let pending = match state.producers.get_mut(transactional_id) {
        Some(producer) => {
            producer.sequences.clear();
            std::mem::take(&mut producer.pending)
        }
        None => return 0,
    };

    let count = pending.len();
    for (tp, offset) in pending {
        if let Ok(log) = partition_mut(state, &tp) {
            if let Some(entry) = log.entries.get_mut(offset as usize) {
                entry.status = status.clone();
            }
        }
    }
    count
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn partitions(&self, topic: &str) -> Result<Vec<u32>, BrokerError> {
        self.create_topic(topic, self.default_partitions);
        let state = self.state.lock();
        let count = state.topics.get(topic).map(|logs| logs.len()).unwrap_or(0);
        Ok((0..count as u32).collect())
    }

    async fn fetch(
        &self,
        tp: &TopicPartition,
        offset: i64,
        max_records: usize,
        isolation: IsolationLevel,
    ) -> Result<FetchResult, BrokerError> {
        let state = self.state.lock();
        let log = partition(&state, tp)?;
        let (records, stopped_at) = scan(log, offset, max_records, isolation);

        Ok(FetchResult {
            end_of_partition: log.sealed && stopped_at >= log.entries.len(),
            records,
        })
    }

    async fn end_offset(&self, tp: &TopicPartition) -> Result<i64, BrokerError> {
        let state = self.state.lock();
        Ok(partition(&state, tp)?.entries.len() as i64)
    }

    async fn committed_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
    ) -> Result<Option<i64>, BrokerError> {
        let state = self.state.lock();
        Ok(state
            .group_offsets
            .get(&(group_id.to_string(), tp.clone()))
            .copied())
    }

    #[instrument(skip(self))]
    async fn commit_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
        offset: i64,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        store_offset(&mut state, group_id, tp, offset);
        Ok(())
    }

    async fn produce(&self, record: ProducerRecord) -> Result<(u32, i64), BrokerError> {
        let mut state = self.state.lock();
        self.append_entry(&mut state, record, EntryStatus::Plain)
    }

    #[instrument(skip(self))]
    async fn init_producer(&self, transactional_id: &str) -> Result<u32, BrokerError> {
        let mut state = self.state.lock();
        let aborted = finish_pending(&mut state, transactional_id, EntryStatus::Aborted);
        if aborted > 0 {
            warn!(
                transactional_id = %transactional_id,
                aborted,
                "Aborted transaction left open by previous producer epoch"
            );
        }

        let epoch = match state.producers.get_mut(transactional_id) {
            Some(producer) => {
                producer.epoch += 1;
                producer.epoch
            }
            None => {
                state
                    .producers
                    .insert(transactional_id.to_string(), ProducerState::default());
                0
            }
        };

        debug!(transactional_id = %transactional_id, epoch, "Initialized producer");
        Ok(epoch)
    }

    async fn append(
        &self,
        producer: &ProducerId,
        sequence: u64,
        record: ProducerRecord,
    ) -> Result<(u32, i64), BrokerError> {
        let mut state = self.state.lock();
        check_epoch(&state, producer)?;

        if let Some(position) = state
            .producers
            .get(&producer.transactional_id)
            .and_then(|p| p.sequences.get(&sequence))
        {
            trace!(sequence, "Duplicate transactional append ignored");
            return Ok(*position);
        }

        let topic = record.topic.clone();
        let (partition, offset) = self.append_entry(&mut state, record, EntryStatus::Pending)?;
        if let Some(open) = state.producers.get_mut(&producer.transactional_id) {
            open.pending.push((TopicPartition::new(topic, partition), offset));
            open.sequences.insert(sequence, (partition, offset));
        }
        Ok((partition, offset))
    }

    #[instrument(skip(self, offsets), fields(transactional_id = %producer.transactional_id, epoch = producer.epoch))]
    async fn end_transaction(
        &self,
        producer: &ProducerId,
        outcome: TransactionOutcome,
        offsets: &OffsetCommit,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        check_epoch(&state, producer)?;

        let status = match outcome {
            TransactionOutcome::Commit => EntryStatus::Committed,
            TransactionOutcome::Abort => EntryStatus::Aborted,
        };
        let records = finish_pending(&mut state, &producer.transactional_id, status);

        if outcome == TransactionOutcome::Commit {
            for (tp, offset) in &offsets.offsets {
                store_offset(&mut state, &offsets.group_id, tp, *offset);
            }
        }

        debug!(?outcome, records, "Transaction ended");
        Ok(())
    }
}

/// Group offsets only move forward
fn store_offset(state: &mut BrokerState, group_id: &str, tp: &TopicPartition, offset: i64) {
    state
        .group_offsets
        .entry((group_id.to_string(), tp.clone()))
        .and_modify(|current| *current = (*current).max(offset))
        .or_insert(offset);
}
