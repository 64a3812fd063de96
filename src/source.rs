//! Ordered record intake from a single partition
//!
//! A [`RecordSource`] hands out records one at a time in offset order and
//! tracks the position of the next record to deliver. Transient broker
//! failures are retried here with backoff and never reach the caller.

use crate::broker::{BrokerClient, IsolationLevel};
use crate::config::{StartPosition, StreamConfig};
use crate::error::{BrokerError, SourceError};
use crate::record::{Record, TopicPartition};
use crate::retry::{ExponentialBackoff, RetryConfig, RetryError, RetryHandle};
use crate::shutdown;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Outcome of one fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Record(Record),
    /// Nothing arrived before the timeout
    Empty,
    /// The partition is sealed and drained; terminal
    Closed,
}

#[async_trait]
pub trait RecordSource: Send {
    fn topic_partition(&self) -> &TopicPartition;

    /// Offset of the next record `fetch` will deliver
    fn position(&self) -> i64;

    /// Wait up to `timeout` for the next record
    ///
    /// After `Fetched::Closed` has been returned once, every further call
    /// fails with [`SourceError::Closed`].
    async fn fetch(&mut self, timeout: Duration) -> Result<Fetched, SourceError>;

    /// Persist that every offset below `offset` has been processed
    ///
    /// Only call this once the output derived from those records is durable.
    async fn commit(&mut self, partition: u32, offset: i64) -> Result<(), SourceError>;

    /// Move the delivery position, discarding anything buffered
    fn seek(&mut self, offset: i64);
}

/// Settings a [`PartitionSource`] needs from the processor configuration
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub group_id: String,
    pub isolation_level: IsolationLevel,
    pub max_poll_records: usize,
    pub poll_interval: Duration,
    pub start_position: StartPosition,
    pub transient_retry: RetryConfig,
}

impl SourceConfig {
    pub fn from_stream_config(config: &StreamConfig) -> Self {
        Self {
            group_id: config.group_id.clone(),
            isolation_level: config.isolation_level,
            max_poll_records: config.max_poll_records,
            poll_interval: config.poll_interval,
            start_position: config.start_position,
            transient_retry: config.transient_retry.clone(),
        }
    }
}

/// [`RecordSource`] backed by a [`BrokerClient`] partition
pub struct PartitionSource<B: BrokerClient> {
    broker: B,
    tp: TopicPartition,
    config: SourceConfig,
    retry: RetryHandle<ExponentialBackoff>,
    shutdown: watch::Receiver<bool>,
    buffer: VecDeque<Record>,
    /// Next offset to request from the broker
    fetch_offset: i64,
    /// Next offset to hand to the caller
    position: i64,
    closed: bool,
}

impl<B: BrokerClient> PartitionSource<B> {
    /// Open a source positioned at the group's committed offset
    ///
    /// Without a committed offset the source starts according to
    /// `config.start_position`.
    pub async fn open(
        broker: B,
        tp: TopicPartition,
        config: SourceConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, SourceError> {
        let retry = RetryHandle::from_config(config.transient_retry.clone());
        let mut source = Self {
            broker,
            tp,
            config,
            retry,
            shutdown,
            buffer: VecDeque::new(),
            fetch_offset: 0,
            position: 0,
            closed: false,
        };

        let start = match source.committed().await? {
            Some(offset) => {
                debug!(partition = %source.tp, offset, "Resuming from committed offset");
                offset
            }
            None => match source.config.start_position {
                StartPosition::Earliest => 0,
                StartPosition::Latest => source.end_offset().await?,
            },
        };

        info!(
            partition = %source.tp,
            group_id = %source.config.group_id,
            offset = start,
            "Opened partition source"
        );
        source.seek(start);
        Ok(source)
    }

    async fn committed(&mut self) -> Result<Option<i64>, SourceError> {
        let broker = &self.broker;
        let tp = &self.tp;
        let group_id = self.config.group_id.as_str();
        self.retry.reset();
        self.retry
            .retry_if(
                move || broker.committed_offset(group_id, tp),
                BrokerError::is_transient,
                &mut self.shutdown,
            )
            .await
            .map_err(source_error)
    }

    async fn end_offset(&mut self) -> Result<i64, SourceError> {
        let broker = &self.broker;
        let tp = &self.tp;
        self.retry.reset();
        self.retry
            .retry_if(
                move || broker.end_offset(tp),
                BrokerError::is_transient,
                &mut self.shutdown,
            )
            .await
            .map_err(source_error)
    }

    /// One broker round trip; returns whether the partition is drained
    async fn poll_broker(&mut self) -> Result<bool, SourceError> {
        let broker = &self.broker;
        let tp = &self.tp;
        let offset = self.fetch_offset;
        let max_records = self.config.max_poll_records;
        let isolation = self.config.isolation_level;

        self.retry.reset();
        let result = self
            .retry
            .retry_if(
                move || broker.fetch(tp, offset, max_records, isolation),
                BrokerError::is_transient,
                &mut self.shutdown,
            )
            .await
            .map_err(source_error)?;

        if let Some(last) = result.records.last() {
            self.fetch_offset = last.offset + 1;
        }
        trace!(
            partition = %self.tp,
            fetched = result.records.len(),
            next_offset = self.fetch_offset,
            "Polled broker"
        );
        let drained = result.end_of_partition && result.records.is_empty();
        self.buffer.extend(result.records);
        Ok(drained)
    }

    fn deliver(&mut self) -> Option<Fetched> {
        self.buffer.pop_front().map(|record| {
            self.position = record.offset + 1;
            Fetched::Record(record)
        })
    }
}

#[async_trait]
impl<B: BrokerClient> RecordSource for PartitionSource<B> {
    fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    fn position(&self) -> i64 {
        self.position
    }

    async fn fetch(&mut self, timeout: Duration) -> Result<Fetched, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        if shutdown::is_requested(&self.shutdown) {
            return Err(SourceError::Shutdown);
        }
        if let Some(fetched) = self.deliver() {
            return Ok(fetched);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let drained = self.poll_broker().await?;
            if let Some(fetched) = self.deliver() {
                return Ok(fetched);
            }
            if drained {
                info!(partition = %self.tp, position = self.position, "Partition closed");
                self.closed = true;
                return Ok(Fetched::Closed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Fetched::Empty);
            }
            let wait = self.config.poll_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown::requested(&mut self.shutdown) => {
                    debug!(partition = %self.tp, "Fetch interrupted by shutdown");
                    return Err(SourceError::Shutdown);
                }
            }
        }
    }

    async fn commit(&mut self, partition: u32, offset: i64) -> Result<(), SourceError> {
        if partition != self.tp.partition {
            return Err(SourceError::Fatal(format!(
                "Source for {} cannot commit partition {}",
                self.tp, partition
            )));
        }

        let broker = &self.broker;
        let tp = &self.tp;
        let group_id = self.config.group_id.as_str();
        self.retry.reset();
        self.retry
            .retry_if(
                move || broker.commit_offset(group_id, tp, offset),
                BrokerError::is_transient,
                &mut self.shutdown,
            )
            .await
            .map_err(source_error)?;

        debug!(partition = %self.tp, offset, "Committed offset");
        Ok(())
    }

    fn seek(&mut self, offset: i64) {
        trace!(partition = %self.tp, offset, "Seeking");
        self.buffer.clear();
        self.fetch_offset = offset;
        self.position = offset;
    }
}

fn source_error(err: RetryError<BrokerError>) -> SourceError {
    match err {
        RetryError::Interrupted => SourceError::Shutdown,
        RetryError::Permanent(e) => SourceError::Fatal(e.to_string()),
        RetryError::MaxRetriesExceeded { attempts, last } => {
            SourceError::Fatal(format!("Gave up after {} attempts: {}", attempts, last))
        }
    }
}
