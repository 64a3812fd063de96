//! Monitoring system for tracking processor behaviour
//!
//! The core emits [`ProcessingEvent`]s on an optional channel; collecting and
//! aggregating them is left to the consumer of that channel.

mod metrics;
mod types;

pub use metrics::{MetricsAggregator, PartitionMetrics};
pub use types::{
    EventEmitter, MonitoringConfig, PartitionEventType, ProcessingEvent, ProcessingEventType,
};
