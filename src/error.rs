//! Error types for the stream processor
//!
//! Every failure is classified into one [`ErrorKind`] so call sites are forced
//! to decide how each kind is handled.

use crate::record::TopicPartition;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;
use tokio::task::JoinError;

/// Closed classification of every error the processor can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Broker or network unavailability; retried with backoff internally
    Transient,
    /// Business-logic failure, owned by the retry policy and the dead-letter router
    Retryable,
    /// Halts the affected partition worker and surfaces to the operator
    Fatal,
    /// A bounded wait expired; an expected outcome, not a crash
    Timeout,
}

/// Errors reported by a broker transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker temporarily unavailable: {0}")]
    Transient(String),

    #[error("Producer {identity} fenced: epoch {attempted} is older than current epoch {current}")]
    Fenced {
        identity: String,
        current: u32,
        attempted: u32,
    },

    #[error("Invalid transaction state: {0}")]
    InvalidTransactionState(String),

    #[error("Unknown partition {0}")]
    UnknownPartition(TopicPartition),

    #[error("Broker error: {0}")]
    Fatal(String),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Transient(_) => ErrorKind::Transient,
            BrokerError::Fenced { .. }
            | BrokerError::InvalidTransactionState(_)
            | BrokerError::UnknownPartition(_)
            | BrokerError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Errors surfaced by a [`RecordSource`](crate::source::RecordSource)
///
/// Transient broker failures never appear here: the source retries them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Source failed: {0}")]
    Fatal(String),

    #[error("Source is closed")]
    Closed,

    #[error("Shutdown requested")]
    Shutdown,
}

/// Errors from the transaction coordinator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction already active for {0}")]
    AlreadyActive(String),

    #[error("No active transaction")]
    NotActive,

    #[error("Transaction aborted: {0}")]
    Aborted(String),

    /// Shutdown arrived mid-commit; the broker transaction was aborted
    #[error("Transaction interrupted by shutdown")]
    Interrupted,

    #[error("Producer fenced: {0}")]
    Fenced(String),

    #[error("Transaction failed: {0}")]
    Fatal(String),
}

impl TransactionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransactionError::Aborted(_) | TransactionError::Interrupted => ErrorKind::Retryable,
            TransactionError::AlreadyActive(_)
            | TransactionError::NotActive
            | TransactionError::Fenced(_)
            | TransactionError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

/// Errors from the windowed aggregator
#[derive(Debug, Clone, Error)]
pub enum WindowError {
    #[error("Counter overflow for key {key} in window starting at {window_start}")]
    CounterOverflow { key: String, window_start: String },

    #[error("Window aggregator is no longer running")]
    AggregatorStopped,

    #[error("Window boundary out of range: {0}")]
    InvalidBoundary(String),

    #[error("Window flush failed: {0}")]
    Flush(#[from] TransactionError),
}

/// Errors from dead-letter routing
#[derive(Debug, Error)]
pub enum DlqError {
    #[error("Failed to write dead-letter entry for {topic}/{partition}/{offset}: {source}")]
    WriteFailed {
        topic: String,
        partition: u32,
        offset: i64,
        #[source]
        source: TransactionError,
    },

    #[error("Record is not a dead-letter entry: {0}")]
    InvalidEntry(String),
}

impl DlqError {
    /// The write was abandoned because shutdown was requested
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            DlqError::WriteFailed {
                source: TransactionError::Interrupted,
                ..
            }
        )
    }
}

/// Errors from request/reply correlation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("No reply received within {0:?}")]
    Timeout(Duration),

    #[error("Correlation id {0} is already awaited")]
    AlreadyWaiting(String),

    #[error("Shutdown requested")]
    Shutdown,
}

impl CorrelationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CorrelationError::Timeout(_) => ErrorKind::Timeout,
            CorrelationError::AlreadyWaiting(_) | CorrelationError::Shutdown => ErrorKind::Fatal,
        }
    }
}

/// Invalid configuration; the processor refuses to start
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Configuration error: {0}")]
pub struct ConfigError(pub String);

/// Main error type for processor operations
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    DeadLetter(#[from] DlqError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error("Worker for {partition} failed: {source}")]
    WorkerFailed {
        partition: TopicPartition,
        #[source]
        source: Box<ProcessorError>,
    },

    #[error("Shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessorError::Broker(e) => e.kind(),
            ProcessorError::Transaction(e) => e.kind(),
            ProcessorError::Correlation(e) => e.kind(),
            ProcessorError::Config(_)
            | ProcessorError::Source(_)
            | ProcessorError::Window(_)
            | ProcessorError::DeadLetter(_)
            | ProcessorError::WorkerFailed { .. }
            | ProcessorError::Shutdown
            | ProcessorError::Other(_) => ErrorKind::Fatal,
        }
    }
}

/// Result type for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

impl From<AcquireError> for ProcessorError {
    fn from(err: AcquireError) -> Self {
        ProcessorError::Other(err.into())
    }
}

impl From<JoinError> for ProcessorError {
    fn from(err: JoinError) -> Self {
        ProcessorError::Other(err.into())
    }
}

/// Failure returned by user-supplied processing hooks
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Retryable failure: {0}")]
    Retryable(#[source] anyhow::Error),

    /// The record can never succeed; skips the retry budget
    #[error("Fatal failure (non-retryable): {0}")]
    Fatal(#[source] anyhow::Error),
}

impl ProcessingError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::Retryable(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::Fatal(err.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessingError::Retryable(_))
    }
}
