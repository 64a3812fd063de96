//! Go Zoom Stream - exactly-once stream processing over a partitioned log
//!
//! This crate consumes records from the partitions of an input topic, runs
//! user logic on them, and commits the produced output together with the
//! consumed offsets in a single broker transaction. Around that core it
//! provides retries with backoff, dead-letter routing, tumbling-window
//! aggregation, request/reply correlation and changelog-backed tables.

pub mod broker;
pub mod config;
pub mod correlation;
pub mod dlq;
pub mod error;
pub mod monitoring;
pub mod processor;
pub mod record;
pub mod retry;
pub mod shutdown;
pub mod source;
pub mod table;
pub mod transaction;
pub mod window;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;

pub use error::{ErrorKind, ProcessingError, ProcessorError, Result};
pub use processor::{EventExtractor, Pipeline, RecordProcessor, StreamProcessor};
pub use retry::{Backoff, ExponentialBackoff, FixedBackoff};

// Re-export main building blocks
pub use crate::broker::{BrokerClient, InMemoryBroker, IsolationLevel};
pub use crate::config::{RetryDelay, StartPosition, StreamConfig};
pub use crate::correlation::CorrelationMatcher;
pub use crate::dlq::{DeadLetterRouter, DlqEntry};
pub use crate::record::{Header, ProducerRecord, Record, TopicPartition};
pub use crate::source::{Fetched, PartitionSource, RecordSource};
pub use crate::table::{Table, TableUpdater};
pub use crate::transaction::TransactionCoordinator;
pub use crate::window::{Clock, SystemClock, WindowAggregate, WindowEvent, WindowedAggregator};
