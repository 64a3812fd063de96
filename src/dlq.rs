//! Dead-letter routing for records that permanently fail processing
//!
//! A dead-letter record keeps the original key, value and headers and adds
//! `x-dlq-*` headers describing where the record came from and why it
//! failed. `x-dlq-entry-id` (`topic/partition/offset`) is a natural key, so a
//! consumer of the dead-letter topic can discard duplicates.

use crate::broker::BrokerClient;
use crate::error::{DlqError, TransactionError};
use crate::record::{Header, ProducerRecord, Record};
use crate::transaction::TransactionCoordinator;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub const HEADER_ORIGINAL_TOPIC: &str = "x-dlq-original-topic";
pub const HEADER_ORIGINAL_PARTITION: &str = "x-dlq-original-partition";
pub const HEADER_ORIGINAL_OFFSET: &str = "x-dlq-original-offset";
pub const HEADER_ERROR_REASON: &str = "x-dlq-error-reason";
pub const HEADER_FAILED_AT: &str = "x-dlq-failed-at";
pub const HEADER_ATTEMPTS: &str = "x-dlq-attempts";
pub const HEADER_ENTRY_ID: &str = "x-dlq-entry-id";

const DLQ_HEADER_PREFIX: &str = "x-dlq-";

/// A permanently failed record and why it failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqEntry {
    pub original_record: Record,
    pub error_reason: String,
    pub failed_at: DateTime<Utc>,
    pub attempts: u32,
}

impl DlqEntry {
    pub fn new(original_record: Record, error_reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            original_record,
            error_reason: error_reason.into(),
            failed_at: Utc::now(),
            attempts,
        }
    }

    pub fn original_topic(&self) -> &str {
        &self.original_record.topic
    }

    pub fn original_partition(&self) -> u32 {
        self.original_record.partition
    }

    pub fn original_offset(&self) -> i64 {
        self.original_record.offset
    }

    /// `topic/partition/offset` of the original record
    pub fn entry_id(&self) -> String {
        format!(
            "{}/{}/{}",
            self.original_record.topic, self.original_record.partition, self.original_record.offset
        )
    }

    /// Encode as a record for `dlq_topic`
    pub fn to_producer_record(&self, dlq_topic: &str) -> ProducerRecord {
        let original = &self.original_record;
        let mut record = ProducerRecord::new(dlq_topic, original.key.clone(), original.value.clone())
            .with_timestamp(original.timestamp);
        record.headers = original.headers.clone();

        record
            .with_header(HEADER_ORIGINAL_TOPIC, original.topic.clone())
            .with_header(HEADER_ORIGINAL_PARTITION, original.partition.to_string())
            .with_header(HEADER_ORIGINAL_OFFSET, original.offset.to_string())
            .with_header(HEADER_ERROR_REASON, self.error_reason.clone())
            .with_header(HEADER_FAILED_AT, self.failed_at.to_rfc3339())
            .with_header(HEADER_ATTEMPTS, self.attempts.to_string())
            .with_header(HEADER_ENTRY_ID, self.entry_id())
    }

    /// Decode a record read from a dead-letter topic
    pub fn from_record(record: &Record) -> Result<Self, DlqError> {
        let topic = required(record, HEADER_ORIGINAL_TOPIC)?.to_string();
        let partition = parse(record, HEADER_ORIGINAL_PARTITION)?;
        let offset = parse(record, HEADER_ORIGINAL_OFFSET)?;
        let attempts = parse(record, HEADER_ATTEMPTS)?;
        let error_reason = required(record, HEADER_ERROR_REASON)?.to_string();
        let failed_at = DateTime::parse_from_rfc3339(required(record, HEADER_FAILED_AT)?)
            .map_err(|e| DlqError::InvalidEntry(format!("{}: {}", HEADER_FAILED_AT, e)))?
            .with_timezone(&Utc);

        let headers: Vec<Header> = record
            .headers
            .iter()
            .filter(|header| !header.name.starts_with(DLQ_HEADER_PREFIX))
            .cloned()
            .collect();

        Ok(Self {
            original_record: Record {
                key: record.key.clone(),
                value: record.value.clone(),
                headers,
                topic,
                partition,
                offset,
                timestamp: record.timestamp,
            },
            error_reason,
            failed_at,
            attempts,
        })
    }

    /// The original record, addressed back to its source partition
    pub fn replay_record(&self) -> ProducerRecord {
        let original = &self.original_record;
        let mut record = ProducerRecord::new(
            original.topic.clone(),
            original.key.clone(),
            original.value.clone(),
        )
        .with_partition(original.partition)
        .with_timestamp(original.timestamp);
        record.headers = original.headers.clone();
        record
    }

    /// Human-readable view for inspection tooling
    pub fn to_json(&self) -> serde_json::Value {
        let original = &self.original_record;
        json!({
            "entry_id": self.entry_id(),
            "original_topic": original.topic,
            "original_partition": original.partition,
            "original_offset": original.offset,
            "key": String::from_utf8_lossy(&original.key),
            "value": String::from_utf8_lossy(&original.value),
            "error_reason": self.error_reason,
            "failed_at": self.failed_at.to_rfc3339(),
            "attempts": self.attempts,
        })
    }
}

fn required<'a>(record: &'a Record, name: &str) -> Result<&'a str, DlqError> {
    record
        .header_str(name)
        .ok_or_else(|| DlqError::InvalidEntry(format!("missing header {}", name)))
}

fn parse<T: std::str::FromStr>(record: &Record, name: &str) -> Result<T, DlqError>
where
    T::Err: std::fmt::Display,
{
    required(record, name)?
        .parse()
        .map_err(|e: T::Err| DlqError::InvalidEntry(format!("{}: {}", name, e)))
}

/// Writes dead-letter entries, optionally together with the failed record's
/// offset advance
#[derive(Debug, Clone)]
pub struct DeadLetterRouter {
    dlq_topic: String,
}

impl DeadLetterRouter {
    pub fn new(dlq_topic: impl Into<String>) -> Self {
        Self {
            dlq_topic: dlq_topic.into(),
        }
    }

    pub fn dlq_topic(&self) -> &str {
        &self.dlq_topic
    }

    /// Dead-letter `record` and commit its partition past it, atomically
    ///
    /// Any failure other than shutdown is fatal for the calling worker:
    /// continuing would either lose the record or re-process it without end.
    pub async fn route<B: BrokerClient>(
        &self,
        coordinator: &mut TransactionCoordinator<B>,
        record: &Record,
        reason: &str,
        attempts: u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<DlqEntry, DlqError> {
        self.write(coordinator, record, reason, attempts, true, shutdown)
            .await
    }

    /// Dead-letter `record` without touching its partition's committed offset
    ///
    /// For callers whose offsets are committed elsewhere, such as the window
    /// aggregator. A crash after this write re-delivers `record`, and the
    /// duplicate entry carries the same `x-dlq-entry-id`.
    pub async fn write_entry<B: BrokerClient>(
        &self,
        coordinator: &mut TransactionCoordinator<B>,
        record: &Record,
        reason: &str,
        attempts: u32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<DlqEntry, DlqError> {
        self.write(coordinator, record, reason, attempts, false, shutdown)
            .await
    }

    async fn write<B: BrokerClient>(
        &self,
        coordinator: &mut TransactionCoordinator<B>,
        record: &Record,
        reason: &str,
        attempts: u32,
        advance_offset: bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<DlqEntry, DlqError> {
        let entry = DlqEntry::new(record.clone(), reason, attempts);
        let write_failed = |source| DlqError::WriteFailed {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            source,
        };

        let staged = coordinator.begin().and_then(|()| {
            coordinator.stage(entry.to_producer_record(&self.dlq_topic))?;
            if advance_offset {
                coordinator.mark_input_offset(record.topic_partition(), record.offset + 1)?;
            }
            Ok(())
        });
        if let Err(e) = staged {
            let _ = coordinator.abort();
            return Err(write_failed(e));
        }

        match coordinator.commit(shutdown).await {
            Ok(()) => {}
            Err(TransactionError::Interrupted) => {
                warn!(entry_id = %entry.entry_id(), "Dead-letter write interrupted by shutdown");
                return Err(write_failed(TransactionError::Interrupted));
            }
            Err(e) => {
                error!(
                    entry_id = %entry.entry_id(),
                    error = %e,
                    "Failed to write dead-letter entry"
                );
                return Err(write_failed(e));
            }
        }

        info!(
            entry_id = %entry.entry_id(),
            dlq_topic = %self.dlq_topic,
            attempts,
            reason = %reason,
            "Record dead-lettered"
        );
        Ok(entry)
    }
}
