//! Broker transport abstraction
//!
//! The processor only needs a narrow slice of a partitioned log: fetch from a
//! partition at an offset, append records, and group appends into
//! transactions that commit atomically with consumer offsets.

use crate::error::BrokerError;
use crate::record::{ProducerRecord, Record, TopicPartition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod memory;

pub use memory::InMemoryBroker;

/// Which records a fetch may return
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Only records from committed transactions and non-transactional appends
    #[default]
    ReadCommitted,
    /// Everything appended, including open and aborted transactions
    ReadUncommitted,
}

/// Records returned by one fetch call
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub records: Vec<Record>,
    /// The partition is sealed and every record has been returned
    pub end_of_partition: bool,
}

/// A transactional producer identity at a given epoch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProducerId {
    pub transactional_id: String,
    pub epoch: u32,
}

/// How an open transaction ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Commit,
    Abort,
}

/// Consumer group offsets committed together with a transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetCommit {
    pub group_id: String,
    pub offsets: BTreeMap<TopicPartition, i64>,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Partition ids of a topic
    async fn partitions(&self, topic: &str) -> Result<Vec<u32>, BrokerError>;

    /// Fetch up to `max_records` starting at `offset`
    async fn fetch(
        &self,
        tp: &TopicPartition,
        offset: i64,
        max_records: usize,
        isolation: IsolationLevel,
    ) -> Result<FetchResult, BrokerError>;

    /// Offset the next appended record will receive
    async fn end_offset(&self, tp: &TopicPartition) -> Result<i64, BrokerError>;

    /// Next offset to read for a consumer group, if one was committed
    async fn committed_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
    ) -> Result<Option<i64>, BrokerError>;

    /// Commit a group offset outside of any transaction
    async fn commit_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
        offset: i64,
    ) -> Result<(), BrokerError>;

    /// Append a record outside of any transaction; returns (partition, offset)
    async fn produce(&self, record: ProducerRecord) -> Result<(u32, i64), BrokerError>;

    /// Register a transactional identity and return its new epoch
    ///
    /// Bumping the epoch fences every older instance and aborts whatever
    /// transaction the previous epoch left open.
    async fn init_producer(&self, transactional_id: &str) -> Result<u32, BrokerError>;

    /// Append a record to the producer's open transaction
    ///
    /// Appends are idempotent per `sequence`: retrying the same sequence
    /// returns the original position instead of appending twice.
    async fn append(
        &self,
        producer: &ProducerId,
        sequence: u64,
        record: ProducerRecord,
    ) -> Result<(u32, i64), BrokerError>;

    /// Commit or abort the producer's open transaction
    async fn end_transaction(
        &self,
        producer: &ProducerId,
        outcome: TransactionOutcome,
        offsets: &OffsetCommit,
    ) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B: BrokerClient + ?Sized> BrokerClient for Arc<B> {
    async fn partitions(&self, topic: &str) -> Result<Vec<u32>, BrokerError> {
        (**self).partitions(topic).await
    }

    async fn fetch(
        &self,
        tp: &TopicPartition,
        offset: i64,
        max_records: usize,
        isolation: IsolationLevel,
    ) -> Result<FetchResult, BrokerError> {
        (**self).fetch(tp, offset, max_records, isolation).await
    }

    async fn end_offset(&self, tp: &TopicPartition) -> Result<i64, BrokerError> {
        (**self).end_offset(tp).await
    }

    async fn committed_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
    ) -> Result<Option<i64>, BrokerError> {
        (**self).committed_offset(group_id, tp).await
    }

    async fn commit_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
        offset: i64,
    ) -> Result<(), BrokerError> {
        (**self).commit_offset(group_id, tp, offset).await
    }

    async fn produce(&self, record: ProducerRecord) -> Result<(u32, i64), BrokerError> {
        (**self).produce(record).await
    }

    async fn init_producer(&self, transactional_id: &str) -> Result<u32, BrokerError> {
        (**self).init_producer(transactional_id).await
    }

    async fn append(
        &self,
        producer: &ProducerId,
        sequence: u64,
        record: ProducerRecord,
    ) -> Result<(u32, i64), BrokerError> {
        (**self).append(producer, sequence, record).await
    }

    async fn end_transaction(
        &self,
        producer: &ProducerId,
        outcome: TransactionOutcome,
        offsets: &OffsetCommit,
    ) -> Result<(), BrokerError> {
        (**self).end_transaction(producer, outcome, offsets).await
    }
}
