use super::types::{PartitionEventType, ProcessingEvent, ProcessingEventType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

/// Key used for events that are not tied to one partition
const GLOBAL_SCOPE: &str = "global";

/// Holds aggregated metrics for a single partition
#[derive(Debug, Clone)]
pub struct PartitionMetrics {
    pub records_processed: u64,
    pub records_retried: u64,
    pub records_dead_lettered: u64,
    pub transactions_aborted: u64,
    pub windows_flushed: u64,
    pub window_keys_flushed: u64,
    pub late_events_dropped: u64,
    pub late_replies_dropped: u64,
    pub worker_failures: u64,
    pub last_updated: Instant,
}

impl Default for PartitionMetrics {
    fn default() -> Self {
        Self {
            records_processed: 0,
            records_retried: 0,
            records_dead_lettered: 0,
            transactions_aborted: 0,
            windows_flushed: 0,
            window_keys_flushed: 0,
            late_events_dropped: 0,
            late_replies_dropped: 0,
            worker_failures: 0,
            last_updated: Instant::now(),
        }
    }
}

/// Aggregates monitoring events into metrics
pub struct MetricsAggregator {
    metrics: Arc<RwLock<HashMap<String, PartitionMetrics>>>,
    window_duration: Duration,
    monitoring_rx: tokio::sync::mpsc::Receiver<ProcessingEvent>,
}

impl MetricsAggregator {
    pub fn new(
        window_duration: Duration,
        monitoring_rx: tokio::sync::mpsc::Receiver<ProcessingEvent>,
    ) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
            window_duration,
            monitoring_rx,
        }
    }

    /// Shared view of the metrics, readable while `run` consumes `self`
    pub fn handle(&self) -> Arc<RwLock<HashMap<String, PartitionMetrics>>> {
        self.metrics.clone()
    }

    /// Process events until the channel closes, logging metrics periodically
    pub async fn run(mut self) {
        let mut interval = interval(self.window_duration);

        loop {
            tokio::select! {
                event = self.monitoring_rx.recv() => match event {
                    Some(event) => self.process_event(event).await,
                    None => {
                        self.emit_metrics().await;
                        debug!("Monitoring channel closed, metrics aggregator stopping");
                        return;
                    }
                },
                _ = interval.tick() => {
                    self.emit_metrics().await;
                }
            }
        }
    }

    pub async fn process_event(&self, event: ProcessingEvent) {
        let scope = event
            .partition
            .as_ref()
            .map(|tp| tp.to_string())
            .unwrap_or_else(|| GLOBAL_SCOPE.to_string());

        let mut metrics = self.metrics.write().await;
        let partition_metrics = metrics.entry(scope.clone()).or_default();

        match event.event_type {
            ProcessingEventType::RecordProcessed { offset } => {
                partition_metrics.records_processed += 1;
                trace!(partition = %scope, offset, "Record processed");
            }
            ProcessingEventType::RecordRetried { .. } => {
                partition_metrics.records_retried += 1;
            }
            ProcessingEventType::RecordDeadLettered { offset, reason, .. } => {
                partition_metrics.records_dead_lettered += 1;
                warn!(partition = %scope, offset, reason = %reason, "Record dead-lettered");
            }
            ProcessingEventType::WindowFlushed { key_count, .. } => {
                partition_metrics.windows_flushed += 1;
                partition_metrics.window_keys_flushed += key_count as u64;
            }
            ProcessingEventType::LateEventDropped { .. } => {
                partition_metrics.late_events_dropped += 1;
            }
            ProcessingEventType::TransactionAborted { reason } => {
                partition_metrics.transactions_aborted += 1;
                warn!(partition = %scope, reason = %reason, "Transaction aborted");
            }
            ProcessingEventType::LateReplyDropped { .. } => {
                partition_metrics.late_replies_dropped += 1;
            }
            ProcessingEventType::Partition {
                event_type,
                details,
            } => match event_type {
                PartitionEventType::Started => {
                    debug!(partition = %scope, "Partition processing started");
                }
                PartitionEventType::Completed => {
                    debug!(partition = %scope, "Partition processing completed");
                }
                PartitionEventType::Failed => {
                    partition_metrics.worker_failures += 1;
                    warn!(partition = %scope, details = ?details, "Partition worker failed");
                }
                PartitionEventType::Interrupted => {
                    info!(partition = %scope, details = ?details, "Partition processing interrupted");
                }
            },
        }

        partition_metrics.last_updated = Instant::now();
    }

    async fn emit_metrics(&self) {
        let metrics = self.metrics.read().await;

        for (scope, metrics) in metrics.iter() {
            if metrics.last_updated.elapsed() > self.window_duration * 2 {
                continue;
            }

            info!(
                partition = %scope,
                records_processed = metrics.records_processed,
                records_retried = metrics.records_retried,
                records_dead_lettered = metrics.records_dead_lettered,
                transactions_aborted = metrics.transactions_aborted,
                windows_flushed = metrics.windows_flushed,
                window_keys_flushed = metrics.window_keys_flushed,
                late_events_dropped = metrics.late_events_dropped,
                late_replies_dropped = metrics.late_replies_dropped,
                "Metrics for window"
            );

            if metrics.records_dead_lettered > 0 {
                warn!(
                    partition = %scope,
                    dead_lettered = metrics.records_dead_lettered,
                    "Records were dead-lettered"
                );
            }
        }
    }

    /// Get current metrics for all partitions
    pub async fn get_metrics(&self) -> HashMap<String, PartitionMetrics> {
        self.metrics.read().await.clone()
    }

    /// Get metrics for a specific partition, or "global" for unscoped events
    pub async fn get_partition_metrics(&self, scope: &str) -> Option<PartitionMetrics> {
        self.metrics.read().await.get(scope).cloned()
    }
}
