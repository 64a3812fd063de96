use crate::record::TopicPartition;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Configuration for the monitoring system
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Whether monitoring is enabled
    pub enabled: bool,
    /// Size of the monitoring channel buffer
    pub channel_size: usize,
    /// How often to emit aggregated metrics
    pub metrics_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_size: 1000,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

/// Represents a monitoring event from the processor
#[derive(Debug, Clone)]
pub struct ProcessingEvent {
    /// When the event occurred
    pub timestamp: SystemTime,
    /// Partition this event relates to, if any
    pub partition: Option<TopicPartition>,
    /// The type of event and its details
    pub event_type: ProcessingEventType,
}

/// The different types of events that can occur during processing
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingEventType {
    RecordProcessed {
        offset: i64,
    },
    RecordRetried {
        offset: i64,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    RecordDeadLettered {
        offset: i64,
        attempt: u32,
        reason: String,
    },
    WindowFlushed {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        key_count: usize,
    },
    LateEventDropped {
        key: String,
        event_time: DateTime<Utc>,
        window_start: DateTime<Utc>,
    },
    TransactionAborted {
        reason: String,
    },
    LateReplyDropped {
        correlation_id: String,
    },
    Partition {
        event_type: PartitionEventType,
        details: Option<String>,
    },
}

/// Lifecycle of a partition worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionEventType {
    Started,
    /// The partition was sealed and fully drained
    Completed,
    /// A fatal error stopped the worker
    Failed,
    /// Shutdown stopped the worker
    Interrupted,
}

impl ProcessingEvent {
    fn new(partition: Option<TopicPartition>, event_type: ProcessingEventType) -> Self {
        Self {
            timestamp: SystemTime::now(),
            partition,
            event_type,
        }
    }

    pub fn record_processed(partition: TopicPartition, offset: i64) -> Self {
        Self::new(Some(partition), ProcessingEventType::RecordProcessed { offset })
    }

    pub fn record_retried(
        partition: TopicPartition,
        offset: i64,
        attempt: u32,
        delay: Duration,
        error: String,
    ) -> Self {
        Self::new(
            Some(partition),
            ProcessingEventType::RecordRetried {
                offset,
                attempt,
                delay,
                error,
            },
        )
    }

    pub fn record_dead_lettered(
        partition: TopicPartition,
        offset: i64,
        attempt: u32,
        reason: String,
    ) -> Self {
        Self::new(
            Some(partition),
            ProcessingEventType::RecordDeadLettered {
                offset,
                attempt,
                reason,
            },
        )
    }

    pub fn window_flushed(start: DateTime<Utc>, end: DateTime<Utc>, key_count: usize) -> Self {
        Self::new(
            None,
            ProcessingEventType::WindowFlushed {
                start,
                end,
                key_count,
            },
        )
    }

    pub fn late_event_dropped(
        partition: Option<TopicPartition>,
        key: String,
        event_time: DateTime<Utc>,
        window_start: DateTime<Utc>,
    ) -> Self {
        Self::new(
            partition,
            ProcessingEventType::LateEventDropped {
                key,
                event_time,
                window_start,
            },
        )
    }

    pub fn transaction_aborted(partition: Option<TopicPartition>, reason: String) -> Self {
        Self::new(partition, ProcessingEventType::TransactionAborted { reason })
    }

    pub fn late_reply_dropped(correlation_id: String) -> Self {
        Self::new(None, ProcessingEventType::LateReplyDropped { correlation_id })
    }

    pub fn partition_event(
        partition: TopicPartition,
        event_type: PartitionEventType,
        details: Option<String>,
    ) -> Self {
        Self::new(
            Some(partition),
            ProcessingEventType::Partition {
                event_type,
                details,
            },
        )
    }
}

/// Sends monitoring events when monitoring is enabled
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    tx: Option<mpsc::Sender<ProcessingEvent>>,
}

impl EventEmitter {
    pub fn new(tx: Option<mpsc::Sender<ProcessingEvent>>) -> Self {
        Self { tx }
    }

    /// An emitter that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Create an emitter and its receiving end according to `config`
    pub fn from_config(config: &MonitoringConfig) -> (Self, Option<mpsc::Receiver<ProcessingEvent>>) {
        if config.enabled {
            let (tx, rx) = mpsc::channel(config.channel_size.max(1));
            (Self::new(Some(tx)), Some(rx))
        } else {
            (Self::disabled(), None)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub async fn emit(&self, event: ProcessingEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.send(event).await {
                warn!(error = %e, "Failed to send monitoring event");
            } else {
                trace!("Sent monitoring event successfully");
            }
        }
    }
}
