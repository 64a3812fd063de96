//! Tumbling-window aggregation
//!
//! [`WindowedAggregator`] is a single-owner actor. Partition workers send it
//! `Ingest` commands and a ticker task sends it `Tick` commands over the same
//! ordered channel, so a flush never observes a half-applied update. Flushing
//! writes one aggregate record per key and the covered input offsets in a
//! single transaction.
//!
//! Window state is held only in memory. Shutdown or a crash discards the open
//! window; its input offsets are not committed, so after a restart the
//! records are re-delivered and only events at or past the last flushed end
//! are aggregated again. Once every handle is dropped, offsets that no open
//! window covers are committed before the actor stops.

mod state;

pub use state::{Accumulator, Admission, ClosedWindow, Window, WindowEvent, WindowState};

use crate::broker::BrokerClient;
use crate::error::{ErrorKind, TransactionError, WindowError};
use crate::monitoring::{EventEmitter, ProcessingEvent};
use crate::record::{ProducerRecord, TopicPartition};
use crate::retry::Backoff;
use crate::shutdown;
use crate::transaction::TransactionCoordinator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Source of "now" for window ticks
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Payload of one flushed aggregate record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowAggregate {
    pub key: String,
    pub count: u64,
    pub sum: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

enum WindowCommand {
    Ingest {
        tp: TopicPartition,
        offset: i64,
        events: Vec<WindowEvent>,
        ack: oneshot::Sender<Result<(), WindowError>>,
    },
    Tick {
        now: DateTime<Utc>,
        ack: Option<oneshot::Sender<Result<(), WindowError>>>,
    },
}

/// Cloneable sender side of the aggregator
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<WindowCommand>,
}

impl AggregatorHandle {
    /// Apply `events` derived from the input record preceding `offset`
    ///
    /// `offset` is the committed offset (next to read) of `tp` once the
    /// events are flushed. An empty `events` only advances the offset.
    pub async fn ingest(
        &self,
        tp: TopicPartition,
        offset: i64,
        events: Vec<WindowEvent>,
    ) -> Result<(), WindowError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WindowCommand::Ingest {
                tp,
                offset,
                events,
                ack,
            })
            .await
            .map_err(|_| WindowError::AggregatorStopped)?;
        done.await.map_err(|_| WindowError::AggregatorStopped)?
    }

    /// Close and flush any window whose end is at or before `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), WindowError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WindowCommand::Tick {
                now,
                ack: Some(ack),
            })
            .await
            .map_err(|_| WindowError::AggregatorStopped)?;
        done.await.map_err(|_| WindowError::AggregatorStopped)?
    }

    async fn tick_detached(&self, now: DateTime<Utc>) -> bool {
        self.tx
            .send(WindowCommand::Tick { now, ack: None })
            .await
            .is_ok()
    }
}

/// Settings for the aggregator actor
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub window_size: Duration,
    pub output_topic: String,
    /// Total flush attempts when a flush transaction aborts
    pub max_flush_attempts: u32,
    pub channel_size: usize,
}

pub struct WindowedAggregator<B: BrokerClient> {
    state: WindowState,
    coordinator: TransactionCoordinator<B>,
    config: AggregatorConfig,
    backoff: Box<dyn Backoff>,
    emitter: EventEmitter,
    rx: mpsc::Receiver<WindowCommand>,
    shutdown: watch::Receiver<bool>,
}

impl<B: BrokerClient + 'static> WindowedAggregator<B> {
    /// Start the actor; it stops when every handle is dropped or on shutdown
    ///
    /// Fails without spawning when `window_size` cannot be expressed in
    /// milliseconds.
    pub fn spawn(
        coordinator: TransactionCoordinator<B>,
        config: AggregatorConfig,
        backoff: Box<dyn Backoff>,
        emitter: EventEmitter,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(AggregatorHandle, JoinHandle<Result<(), WindowError>>), WindowError> {
        let state = WindowState::new(config.window_size)?;
        let (tx, rx) = mpsc::channel(config.channel_size.max(1));
        let aggregator = Self {
            state,
            coordinator,
            config,
            backoff,
            emitter,
            rx,
            shutdown,
        };
        let handle = tokio::spawn(aggregator.run());
        Ok((AggregatorHandle { tx }, handle))
    }

    async fn run(mut self) -> Result<(), WindowError> {
        info!(
            window_size = ?self.config.window_size,
            output_topic = %self.config.output_topic,
            "Window aggregator started"
        );
        let mut stop = self.shutdown.clone();

        let result = loop {
            let command = tokio::select! {
                command = self.rx.recv() => command,
                _ = shutdown::requested(&mut stop) => break Ok(()),
            };
            let Some(command) = command else {
                // Every handle is gone; offsets outside an open window are safe to commit
                break self.commit_idle_offsets().await;
            };

            // Any error stops the actor
            let failed = match command {
                WindowCommand::Ingest {
                    tp,
                    offset,
                    events,
                    ack,
                } => {
                    let result = self.on_ingest(tp, offset, events).await;
                    let failed = result.as_ref().err().cloned();
                    let _ = ack.send(result);
                    failed
                }
                WindowCommand::Tick { now, ack } => {
                    let result = self.on_tick(now).await;
                    let failed = result.as_ref().err().cloned();
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                    failed
                }
            };
            if let Some(e) = failed {
                break Err(e);
            }
        };

        if let Some(window) = self.state.discard() {
            warn!(
                start = %window.start,
                end = %window.end,
                keys = window.aggregates.len(),
                "Discarding partial window on stop"
            );
        }

        match result {
            Ok(()) => {
                info!("Window aggregator stopped");
                Ok(())
            }
            Err(WindowError::Flush(TransactionError::Interrupted)) => {
                info!("Window aggregator stopped during flush");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Window aggregator failed");
                Err(WindowError::AggregatorStopped)
            }
        }
    }

    async fn on_ingest(
        &mut self,
        tp: TopicPartition,
        offset: i64,
        events: Vec<WindowEvent>,
    ) -> Result<(), WindowError> {
        for event in events {
            if let Some(closed) = self.state.advance_for(&event) {
                self.flush(closed).await?;
            }

            match self.state.apply(&event)? {
                Admission::Applied => {}
                Admission::Late { window_start } => {
                    debug!(
                        partition = %tp,
                        key = %event.key,
                        event_time = %event.event_time,
                        %window_start,
                        "Dropping late event"
                    );
                    self.emitter
                        .emit(ProcessingEvent::late_event_dropped(
                            Some(tp.clone()),
                            event.key,
                            event.event_time,
                            window_start,
                        ))
                        .await;
                }
            }
        }

        self.state.mark_offset(tp, offset);
        Ok(())
    }

    async fn on_tick(&mut self, now: DateTime<Utc>) -> Result<(), WindowError> {
        match self.state.tick(now) {
            Some(closed) => self.flush(closed).await,
            None => self.commit_idle_offsets().await,
        }
    }

    async fn commit_idle_offsets(&mut self) -> Result<(), WindowError> {
        let Some(offsets) = self.state.take_idle_offsets() else {
            return Ok(());
        };
        let result = self.commit_with_retry(&[], &offsets).await;
        if result.is_err() {
            self.state.restore_offsets(offsets);
        }
        result
    }

    async fn flush(&mut self, closed: ClosedWindow) -> Result<(), WindowError> {
        let ClosedWindow { window, offsets } = closed;
        let records = aggregate_records(&self.config.output_topic, &window)?;

        self.commit_with_retry(&records, &offsets).await?;

        info!(
            start = %window.start,
            end = %window.end,
            keys = window.aggregates.len(),
            "Window flushed"
        );
        self.emitter
            .emit(ProcessingEvent::window_flushed(
                window.start,
                window.end,
                window.aggregates.len(),
            ))
            .await;
        Ok(())
    }

    async fn commit_with_retry(
        &mut self,
        records: &[ProducerRecord],
        offsets: &BTreeMap<TopicPartition, i64>,
    ) -> Result<(), WindowError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.coordinator.begin()?;
            for record in records {
                self.coordinator.stage(record.clone())?;
            }
            for (tp, offset) in offsets {
                self.coordinator.mark_input_offset(tp.clone(), *offset)?;
            }

            match self.coordinator.commit(&mut self.shutdown).await {
                Ok(()) => return Ok(()),
                Err(TransactionError::Interrupted) => {
                    return Err(WindowError::Flush(TransactionError::Interrupted));
                }
                Err(e) if e.kind() == ErrorKind::Retryable && attempt < self.config.max_flush_attempts => {
                    let delay = self.backoff.next_delay(attempt - 1);
                    warn!(attempt, delay_ms = ?delay.as_millis(), error = %e, "Window flush aborted, retrying");
                    self.emitter
                        .emit(ProcessingEvent::transaction_aborted(None, e.to_string()))
                        .await;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown::requested(&mut self.shutdown) => {
                            debug!("Shutdown requested during flush back-off");
                            return Err(WindowError::Flush(TransactionError::Interrupted));
                        }
                    }
                }
                Err(e) => {
                    self.emitter
                        .emit(ProcessingEvent::transaction_aborted(None, e.to_string()))
                        .await;
                    return Err(WindowError::Flush(e));
                }
            }
        }
    }
}

fn aggregate_records(topic: &str, window: &Window) -> Result<Vec<ProducerRecord>, WindowError> {
    window
        .aggregates
        .iter()
        .map(|(key, acc)| {
            let aggregate = WindowAggregate {
                key: key.clone(),
                count: acc.count,
                sum: acc.sum,
                window_start: window.start,
                window_end: window.end,
            };
            let payload = serde_json::to_vec(&aggregate)
                .map_err(|e| WindowError::Flush(TransactionError::Fatal(e.to_string())))?;
            Ok(ProducerRecord::new(topic, key.clone(), payload).with_timestamp(window.end))
        })
        .collect()
}

/// Send `Tick(clock.now())` every `interval` until shutdown or the aggregator stops
pub fn spawn_ticker(
    handle: AggregatorHandle,
    clock: Arc<dyn Clock>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    if !handle.tick_detached(clock.now()).await {
                        debug!("Aggregator gone, ticker stopping");
                        return;
                    }
                }
                _ = shutdown::requested(&mut shutdown) => {
                    debug!("Ticker stopping on shutdown");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, IsolationLevel};
    use crate::retry::{FixedBackoff, RetryConfig};
    use crate::test::mocks::FaultyBroker;
    use crate::test::TestUtils;
    use pretty_assertions::assert_eq;

    async fn spawn_aggregator<B: BrokerClient + 'static>(
        broker: B,
        emitter: EventEmitter,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<(AggregatorHandle, JoinHandle<Result<(), WindowError>>)> {
        spawn_with_backoff(broker, emitter, shutdown, Duration::from_millis(1)).await
    }

    async fn spawn_with_backoff<B: BrokerClient + 'static>(
        broker: B,
        emitter: EventEmitter,
        shutdown: watch::Receiver<bool>,
        delay: Duration,
    ) -> anyhow::Result<(AggregatorHandle, JoinHandle<Result<(), WindowError>>)> {
        let (_tx, mut init_rx) = watch::channel(false);
        let coordinator = TransactionCoordinator::init(
            broker,
            "agg-window",
            "agg",
            RetryConfig::default(),
            &mut init_rx,
        )
        .await?;
        let config = AggregatorConfig {
            window_size: Duration::from_secs(10),
            output_topic: "counts".to_string(),
            max_flush_attempts: 3,
            channel_size: 16,
        };
        let backoff = Box::new(FixedBackoff::new(delay));
        Ok(WindowedAggregator::spawn(coordinator, config, backoff, emitter, shutdown)?)
    }

    fn read_aggregates(broker: &InMemoryBroker) -> anyhow::Result<Vec<WindowAggregate>> {
        broker
            .read_all(&TopicPartition::new("counts", 0), IsolationLevel::ReadCommitted)?
            .iter()
            .map(|record| -> anyhow::Result<WindowAggregate> {
                Ok(serde_json::from_slice(&record.value)?)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_flush_on_window_boundary() -> anyhow::Result<()> {
        let broker = InMemoryBroker::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) = spawn_aggregator(broker.clone(), EventEmitter::disabled(), shutdown_rx).await?;
        let tp = TopicPartition::new("clicks", 0);

        for (offset, secs) in [1, 4, 9, 11].into_iter().enumerate() {
            handle
                .ingest(tp.clone(), offset as i64 + 1, vec![WindowEvent::new("u1", 1, TestUtils::at_secs(secs))])
                .await?;
        }

        assert_eq!(
            read_aggregates(&broker)?,
            vec![WindowAggregate {
                key: "u1".to_string(),
                count: 3,
                sum: 3,
                window_start: TestUtils::at_secs(0),
                window_end: TestUtils::at_secs(10),
            }]
        );
        assert_eq!(broker.committed_offset("agg", &tp).await?, Some(3));

        handle.tick(TestUtils::at_secs(20)).await?;
        let aggregates = read_aggregates(&broker)?;
        assert_eq!(aggregates.len(), 2);
        assert_eq!(aggregates[1].window_start, TestUtils::at_secs(10));
        assert_eq!(aggregates[1].count, 1);
        assert_eq!(broker.committed_offset("agg", &tp).await?, Some(4));
        Ok(())
    }

    #[tokio::test]
    async fn test_late_event_reported_once() -> anyhow::Result<()> {
        let broker = InMemoryBroker::new();
        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) =
            spawn_aggregator(broker.clone(), EventEmitter::new(Some(tx)), shutdown_rx).await?;
        let tp = TopicPartition::new("clicks", 0);

        handle
            .ingest(tp.clone(), 1, vec![WindowEvent::new("u1", 1, TestUtils::at_secs(12))])
            .await?;
        handle
            .ingest(tp.clone(), 2, vec![WindowEvent::new("u1", 5, TestUtils::at_secs(3))])
            .await?;
        handle.tick(TestUtils::at_secs(30)).await?;

        let mut late = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.event_type, crate::monitoring::ProcessingEventType::LateEventDropped { .. }) {
                late += 1;
            }
        }
        assert_eq!(late, 1);

        let aggregates = read_aggregates(&broker)?;
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].sum, 1);
        assert_eq!(broker.committed_offset("agg", &tp).await?, Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_discards_partial_window() -> anyhow::Result<()> {
        let broker = InMemoryBroker::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) = spawn_aggregator(broker.clone(), EventEmitter::disabled(), shutdown_rx).await?;
        let tp = TopicPartition::new("clicks", 0);

        handle
            .ingest(tp.clone(), 1, vec![WindowEvent::new("u1", 1, TestUtils::at_secs(1))])
            .await?;
        shutdown_tx.send(true)?;
        task.await??;

        assert!(read_aggregates(&broker)?.is_empty());
        assert_eq!(broker.committed_offset("agg", &tp).await?, None);
        assert!(matches!(
            handle.tick(TestUtils::at_secs(100)).await,
            Err(WindowError::AggregatorStopped)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_overflow_stops_aggregator() -> anyhow::Result<()> {
        let broker = InMemoryBroker::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) = spawn_aggregator(broker, EventEmitter::disabled(), shutdown_rx).await?;
        let tp = TopicPartition::new("clicks", 0);

        let result = handle
            .ingest(
                tp,
                1,
                vec![
                    WindowEvent::new("u1", u64::MAX, TestUtils::at_secs(1)),
                    WindowEvent::new("u1", 1, TestUtils::at_secs(2)),
                ],
            )
            .await;
        assert!(matches!(result, Err(WindowError::CounterOverflow { .. })));
        assert!(task.await?.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_handles_commit_idle_offsets() -> anyhow::Result<()> {
        let broker = InMemoryBroker::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) = spawn_aggregator(broker.clone(), EventEmitter::disabled(), shutdown_rx).await?;
        let clicks = TopicPartition::new("clicks", 0);
        let views = TopicPartition::new("views", 0);

        handle.ingest(clicks.clone(), 3, Vec::new()).await?;
        handle.ingest(views.clone(), 1, Vec::new()).await?;
        drop(handle);
        task.await??;

        assert_eq!(broker.committed_offset("agg", &clicks).await?, Some(3));
        assert_eq!(broker.committed_offset("agg", &views).await?, Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_handles_keep_open_window_offsets() -> anyhow::Result<()> {
        let broker = InMemoryBroker::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) = spawn_aggregator(broker.clone(), EventEmitter::disabled(), shutdown_rx).await?;
        let tp = TopicPartition::new("clicks", 0);

        handle
            .ingest(tp.clone(), 1, vec![WindowEvent::new("u1", 1, TestUtils::at_secs(1))])
            .await?;
        handle.ingest(tp.clone(), 2, Vec::new()).await?;
        drop(handle);
        task.await??;

        assert!(read_aggregates(&broker)?.is_empty());
        assert_eq!(broker.committed_offset("agg", &tp).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_cuts_flush_backoff_short() -> anyhow::Result<()> {
        let broker = Arc::new(FaultyBroker::new(InMemoryBroker::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, task) = spawn_with_backoff(
            broker.clone(),
            EventEmitter::disabled(),
            shutdown_rx,
            Duration::from_secs(60),
        )
        .await?;
        let tp = TopicPartition::new("clicks", 0);

        handle
            .ingest(tp.clone(), 1, vec![WindowEvent::new("u1", 1, TestUtils::at_secs(1))])
            .await?;
        broker.fail_next_commits(usize::MAX);
        let tick = tokio::spawn(async move { handle.tick(TestUtils::at_secs(20)).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true)?;
        tokio::time::timeout(Duration::from_secs(2), task).await???;

        assert!(matches!(
            tick.await?,
            Err(WindowError::Flush(TransactionError::Interrupted))
        ));
        assert!(broker.inner().read_topic("counts").is_empty());
        assert_eq!(broker.inner().committed_offset("agg", &tp).await?, None);
        Ok(())
    }
}
