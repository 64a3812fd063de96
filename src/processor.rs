//! Core processor implementation
//!
//! [`StreamProcessor`] consumes every partition of one input topic. Each
//! partition gets its own worker task that:
//!
//! - pulls records in offset order from a [`PartitionSource`]
//! - runs the user pipeline (a per-record transform or window event extraction)
//! - commits transform output together with the input offset in one transaction
//! - retries failing records and dead-letters them once the budget is spent
//!
//! A fatal error stops only the worker it happened in; the remaining
//! partitions keep running until shutdown or until their partitions close.

use crate::broker::BrokerClient;
use crate::config::StreamConfig;
use crate::dlq::DeadLetterRouter;
use crate::error::{
    ErrorKind, ProcessingError, ProcessorError, Result, SourceError, TransactionError, WindowError,
};
use crate::monitoring::{EventEmitter, PartitionEventType, ProcessingEvent};
use crate::record::{ProducerRecord, Record, TopicPartition};
use crate::retry::{from_delay, RetryDecision, RetryHandle, RetryPolicyEngine, RetryState};
use crate::shutdown;
use crate::source::{Fetched, PartitionSource, RecordSource, SourceConfig};
use crate::transaction::TransactionCoordinator;
use crate::window::{
    spawn_ticker, AggregatorConfig, AggregatorHandle, Clock, SystemClock, WindowEvent,
    WindowedAggregator,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, trace, warn};

/// Per-record business logic for a transform pipeline
///
/// # Examples
///
/// ```rust
/// use go_zoom_stream::{ProcessingError, ProducerRecord, Record, RecordProcessor};
///
/// struct Uppercase;
///
/// #[async_trait::async_trait]
/// impl RecordProcessor for Uppercase {
///     async fn process(&self, record: &Record) -> Result<Vec<ProducerRecord>, ProcessingError> {
///         let text = std::str::from_utf8(&record.value).map_err(ProcessingError::fatal)?;
///         Ok(vec![ProducerRecord::new(
///             "uppercased",
///             record.key.clone(),
///             text.to_uppercase(),
///         )])
///     }
/// }
/// ```
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    /// Produce the output records for `record`
    ///
    /// * `Err(ProcessingError::Retryable)` is retried up to the retry budget
    /// * `Err(ProcessingError::Fatal)` dead-letters the record immediately
    async fn process(&self, record: &Record) -> std::result::Result<Vec<ProducerRecord>, ProcessingError>;
}

/// Turns an input record into keyed window events
#[async_trait]
pub trait EventExtractor: Send + Sync {
    /// An empty result skips the record
    async fn extract(&self, record: &Record) -> std::result::Result<Vec<WindowEvent>, ProcessingError>;
}

/// What the processor does with each record
#[derive(Clone)]
pub enum Pipeline {
    Transform(Arc<dyn RecordProcessor>),
    Windowed(Arc<dyn EventExtractor>),
}

impl Pipeline {
    pub fn transform(processor: impl RecordProcessor + 'static) -> Self {
        Pipeline::Transform(Arc::new(processor))
    }

    pub fn windowed(extractor: impl EventExtractor + 'static) -> Self {
        Pipeline::Windowed(Arc::new(extractor))
    }
}

/// How a partition worker ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionExit {
    Completed,
    Interrupted,
}

enum Handled {
    Done,
    Interrupted,
}

/// Internal context shared by every partition worker
#[derive(Clone)]
struct ProcessingContext<B>
where
    B: BrokerClient + Clone + 'static,
{
    broker: B,
    config: Arc<StreamConfig>,
    pipeline: Pipeline,
    emitter: EventEmitter,
    policy: Arc<RetryPolicyEngine>,
    dlq: DeadLetterRouter,
    aggregator: Option<AggregatorHandle>,
}

impl<B> ProcessingContext<B>
where
    B: BrokerClient + Clone + 'static,
{
    fn transactional_id(&self, tp: &TopicPartition) -> String {
        format!(
            "{}-{}-{}",
            self.config.transactional_identity, tp.topic, tp.partition
        )
    }
}

/// Main stream processor
///
/// # Examples
///
/// ```rust,no_run
/// use go_zoom_stream::{InMemoryBroker, Pipeline, ProcessorError, RecordProcessor, StreamConfig, StreamProcessor};
///
/// async fn run(processor: impl RecordProcessor + 'static) -> Result<(), ProcessorError> {
///     let config = StreamConfig {
///         input_topic: "orders".to_string(),
///         group_id: "order-processing".to_string(),
///         dlq_topic: "orders-dlq".to_string(),
///         transactional_identity: "order-processor".to_string(),
///         ..Default::default()
///     };
///     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
///
///     let (processor, _monitoring_rx) =
///         StreamProcessor::new(config, InMemoryBroker::new(), Pipeline::transform(processor));
///     processor.run(shutdown_rx).await
/// }
/// ```
pub struct StreamProcessor<B>
where
    B: BrokerClient + Clone + 'static,
{
    broker: B,
    config: StreamConfig,
    pipeline: Pipeline,
    emitter: EventEmitter,
    clock: Arc<dyn Clock>,
}

impl<B> StreamProcessor<B>
where
    B: BrokerClient + Clone + 'static,
{
    /// Returns the processor and, when monitoring is enabled, the receiving
    /// end of its monitoring channel
    pub fn new(
        config: StreamConfig,
        broker: B,
        pipeline: Pipeline,
    ) -> (Self, Option<mpsc::Receiver<ProcessingEvent>>) {
        let (emitter, monitoring_rx) = EventEmitter::from_config(&config.monitoring);
        (
            Self {
                broker,
                config,
                pipeline,
                emitter,
                clock: Arc::new(SystemClock),
            },
            monitoring_rx,
        )
    }

    /// Replace the clock driving window ticks
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Process every partition until shutdown or until all partitions close
    ///
    /// Returns the first worker failure, after every worker has stopped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        match &self.pipeline {
            Pipeline::Transform(_) => self.config.validate()?,
            Pipeline::Windowed(_) => self.config.validate_windowed()?,
        }
        info!(topic = %self.config.input_topic, group_id = %self.config.group_id, "Starting stream processor");

        let partitions = match self.discover_partitions(&mut shutdown).await {
            Ok(partitions) => partitions,
            Err(ProcessorError::Shutdown) => return Ok(()),
            Err(e) => return Err(e),
        };
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut window_tasks = None;
        let mut ctx = ProcessingContext {
            broker: self.broker.clone(),
            config: Arc::new(self.config.clone()),
            pipeline: self.pipeline.clone(),
            emitter: self.emitter.clone(),
            policy: Arc::new(RetryPolicyEngine::from_config(&self.config)),
            dlq: DeadLetterRouter::new(self.config.dlq_topic.clone()),
            aggregator: None,
        };

        if matches!(self.pipeline, Pipeline::Windowed(_)) {
            let coordinator = match TransactionCoordinator::init(
                self.broker.clone(),
                &format!("{}-window", self.config.transactional_identity),
                &self.config.group_id,
                self.config.transient_retry.clone(),
                &mut shutdown,
            )
            .await
            {
                Ok(coordinator) => coordinator,
                Err(TransactionError::Interrupted) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let (handle, actor) = WindowedAggregator::spawn(
                coordinator,
                AggregatorConfig {
                    window_size: self.config.window_size,
                    output_topic: self.config.output_topic.clone(),
                    max_flush_attempts: self.config.max_retries,
                    channel_size: self.config.max_poll_records,
                },
                from_delay(&self.config.retry_delay, self.config.jitter_factor),
                self.emitter.clone(),
                shutdown.clone(),
            )?;
            let ticker = spawn_ticker(
                handle.clone(),
                self.clock.clone(),
                self.config.tick_interval,
                stop_rx.clone(),
            );
            ctx.aggregator = Some(handle);
            window_tasks = Some((actor, ticker));
        }

        let semaphore = self
            .config
            .max_concurrent_partitions
            .map(|limit| Arc::new(Semaphore::new(limit as usize)));

        let mut handles = Vec::new();
        for partition in partitions {
            let tp = TopicPartition::new(self.config.input_topic.clone(), partition);
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let shutdown_rx = shutdown.clone();

            let handle = tokio::spawn(async move {
                let _permit = if let Some(sem) = &semaphore {
                    Some(sem.acquire().await?)
                } else {
                    None
                };

                Self::process_partition(ctx, tp, shutdown_rx).await
            });
            handles.push((TopicPartition::new(self.config.input_topic.clone(), partition), handle));
        }
        drop(ctx);

        let (worker_partitions, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let results = futures::future::join_all(handles).await;

        let mut first_error = None;
        for (tp, joined) in worker_partitions.into_iter().zip(results) {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(ProcessorError::WorkerFailed {
                        partition: tp,
                        source: Box::new(e),
                    });
                }
            }
        }

        if let Some((actor, ticker)) = window_tasks {
            let _ = stop_tx.send(true);
            if let Err(e) = ticker.await {
                warn!(error = %e, "Window ticker task failed");
            }
            // Every handle is gone now, so the actor drains its queue and stops
            match actor.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(ProcessorError::Window(e));
                }
                Err(e) => {
                    first_error.get_or_insert(e.into());
                }
            }
        }

        match first_error {
            Some(e) => {
                error!(error = %e, "Stream processor stopped with a failed worker");
                Err(e)
            }
            None => {
                info!("Processor shutdown complete");
                Ok(())
            }
        }
    }

    async fn discover_partitions(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Vec<u32>> {
        let broker = &self.broker;
        let topic = self.config.input_topic.as_str();
        let mut retry = RetryHandle::from_config(self.config.transient_retry.clone());
        let partitions = retry
            .retry_if(
                || broker.partitions(topic),
                crate::error::BrokerError::is_transient,
                shutdown,
            )
            .await?;
        debug!(topic = %topic, count = partitions.len(), "Discovered partitions");
        Ok(partitions)
    }

    /// Run one partition worker and report how it ended
    async fn process_partition(
        ctx: ProcessingContext<B>,
        tp: TopicPartition,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        ctx.emitter
            .emit(ProcessingEvent::partition_event(
                tp.clone(),
                PartitionEventType::Started,
                None,
            ))
            .await;

        let result = Self::partition_loop(&ctx, &tp, &mut shutdown).await;

        match result {
            Ok(exit) => {
                let event_type = match exit {
                    PartitionExit::Completed => PartitionEventType::Completed,
                    PartitionExit::Interrupted => PartitionEventType::Interrupted,
                };
                info!(partition = %tp, ?exit, "Partition worker stopped");
                ctx.emitter
                    .emit(ProcessingEvent::partition_event(tp, event_type, None))
                    .await;
                Ok(())
            }
            Err(e) => {
                error!(partition = %tp, error = %e, "Partition worker failed");
                ctx.emitter
                    .emit(ProcessingEvent::partition_event(
                        tp,
                        PartitionEventType::Failed,
                        Some(e.to_string()),
                    ))
                    .await;
                Err(e)
            }
        }
    }

    async fn partition_loop(
        ctx: &ProcessingContext<B>,
        tp: &TopicPartition,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<PartitionExit> {
        let mut source = match PartitionSource::open(
            ctx.broker.clone(),
            tp.clone(),
            SourceConfig::from_stream_config(&ctx.config),
            shutdown.clone(),
        )
        .await
        {
            Ok(source) => source,
            Err(SourceError::Shutdown) => return Ok(PartitionExit::Interrupted),
            Err(e) => return Err(e.into()),
        };

        let coordinator = TransactionCoordinator::init(
            ctx.broker.clone(),
            &ctx.transactional_id(tp),
            &ctx.config.group_id,
            ctx.config.transient_retry.clone(),
            shutdown,
        )
        .await;
        let mut coordinator = match coordinator {
            Ok(coordinator) => coordinator,
            Err(_) if shutdown::is_requested(shutdown) => return Ok(PartitionExit::Interrupted),
            Err(e) => return Err(e.into()),
        };

        loop {
            if shutdown::is_requested(shutdown) {
                return Ok(PartitionExit::Interrupted);
            }

            let record = match source.fetch(ctx.config.fetch_timeout).await {
                Ok(Fetched::Record(record)) => record,
                Ok(Fetched::Empty) => continue,
                Ok(Fetched::Closed) => return Ok(PartitionExit::Completed),
                Err(SourceError::Shutdown) => return Ok(PartitionExit::Interrupted),
                Err(e) => return Err(e.into()),
            };

            trace!(partition = %tp, offset = record.offset, "Processing record");
            let handled = match Self::handle_record(ctx, &mut coordinator, &record, shutdown).await {
                Ok(handled) => handled,
                // The aggregator stops on shutdown before in-flight ingests are acked
                Err(ProcessorError::Window(
                    WindowError::AggregatorStopped | WindowError::Flush(TransactionError::Interrupted),
                )) if shutdown::is_requested(shutdown) => Handled::Interrupted,
                Err(e) => return Err(e),
            };
            match handled {
                Handled::Done => {}
                Handled::Interrupted => {
                    source.seek(record.offset);
                    return Ok(PartitionExit::Interrupted);
                }
            }
        }
    }

    /// Process one record to completion: committed, dead-lettered, or
    /// interrupted by shutdown
    async fn handle_record(
        ctx: &ProcessingContext<B>,
        coordinator: &mut TransactionCoordinator<B>,
        record: &Record,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Handled> {
        let tp = record.topic_partition();
        let mut retry_state: Option<RetryState> = None;

        loop {
            let failure = match Self::attempt(ctx, coordinator, record, shutdown).await? {
                Attempt::Done => {
                    if let Some(state) = &retry_state {
                        debug!(
                            partition = %tp,
                            offset = record.offset,
                            attempts = state.attempt + 1,
                            "Record succeeded after retry"
                        );
                    }
                    ctx.emitter
                        .emit(ProcessingEvent::record_processed(tp, record.offset))
                        .await;
                    return Ok(Handled::Done);
                }
                Attempt::Interrupted => {
                    info!(partition = %tp, offset = record.offset, "Shutdown requested during commit");
                    return Ok(Handled::Interrupted);
                }
                Attempt::Failed(failure) => failure,
            };

            let state = retry_state.get_or_insert_with(|| RetryState::new(record.clone()));
            match failure {
                AttemptFailure::Processing(e) => state.record_failure(&e),
                AttemptFailure::Aborted(e) => state.record_kind(ErrorKind::Retryable, e.to_string()),
            }

            match ctx.policy.should_retry(state) {
                RetryDecision::Retry { after } => {
                    warn!(
                        partition = %tp,
                        offset = record.offset,
                        attempt = state.attempt,
                        delay_ms = ?after.as_millis(),
                        error = %state.last_message,
                        "Record failed, will retry"
                    );
                    ctx.emitter
                        .emit(ProcessingEvent::record_retried(
                            tp.clone(),
                            record.offset,
                            state.attempt,
                            after,
                            state.last_message.clone(),
                        ))
                        .await;

                    state.schedule(after);
                    tokio::select! {
                        _ = tokio::time::sleep_until(state.next_eligible_time) => {}
                        _ = shutdown::requested(shutdown) => {
                            info!(partition = %tp, offset = record.offset, "Shutdown requested during retry wait");
                            return Ok(Handled::Interrupted);
                        }
                    }
                }
                RetryDecision::GiveUp => {
                    let routed = Self::dead_letter(ctx, coordinator, record, state, shutdown).await;
                    match routed {
                        Ok(()) => {}
                        Err(ProcessorError::DeadLetter(e)) if e.is_interrupted() => {
                            info!(partition = %tp, offset = record.offset, "Shutdown requested during dead-letter write");
                            return Ok(Handled::Interrupted);
                        }
                        Err(e) => return Err(e),
                    }
                    ctx.emitter
                        .emit(ProcessingEvent::record_dead_lettered(
                            tp,
                            record.offset,
                            state.attempt,
                            state.last_message.clone(),
                        ))
                        .await;
                    return Ok(Handled::Done);
                }
            }
        }
    }

    /// Dead-letter `record` and advance its partition past it
    ///
    /// A transform worker commits the entry and the offset together. In
    /// windowed mode earlier records of the partition may still sit in an open
    /// window, so only the entry is committed here and the offset advance is
    /// handed to the aggregator, which commits it with the next flush.
    async fn dead_letter(
        ctx: &ProcessingContext<B>,
        coordinator: &mut TransactionCoordinator<B>,
        record: &Record,
        state: &RetryState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        match &ctx.aggregator {
            None => {
                ctx.dlq
                    .route(coordinator, record, &state.last_message, state.attempt, shutdown)
                    .await?;
            }
            Some(aggregator) => {
                ctx.dlq
                    .write_entry(coordinator, record, &state.last_message, state.attempt, shutdown)
                    .await?;
                aggregator
                    .ingest(record.topic_partition(), record.offset + 1, Vec::new())
                    .await?;
            }
        }
        Ok(())
    }

    /// One attempt at a record
    async fn attempt(
        ctx: &ProcessingContext<B>,
        coordinator: &mut TransactionCoordinator<B>,
        record: &Record,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Attempt> {
        let tp = record.topic_partition();
        let next_offset = record.offset + 1;

        match &ctx.pipeline {
            Pipeline::Transform(processor) => {
                let outputs = match processor.process(record).await {
                    Ok(outputs) => outputs,
                    Err(e) => return Ok(Attempt::Failed(AttemptFailure::Processing(e))),
                };

                coordinator.begin()?;
                for output in outputs {
                    coordinator.stage(output)?;
                }
                coordinator.mark_input_offset(tp.clone(), next_offset)?;

                match coordinator.commit(shutdown).await {
                    Ok(()) => Ok(Attempt::Done),
                    Err(TransactionError::Interrupted) => Ok(Attempt::Interrupted),
                    Err(e) if e.kind() == ErrorKind::Retryable => {
                        ctx.emitter
                            .emit(ProcessingEvent::transaction_aborted(Some(tp), e.to_string()))
                            .await;
                        Ok(Attempt::Failed(AttemptFailure::Aborted(e)))
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Pipeline::Windowed(extractor) => {
                let events = match extractor.extract(record).await {
                    Ok(events) => events,
                    Err(e) => return Ok(Attempt::Failed(AttemptFailure::Processing(e))),
                };
                let aggregator = ctx.aggregator.as_ref().ok_or_else(|| {
                    ProcessorError::Other(anyhow::anyhow!("Windowed pipeline without aggregator"))
                })?;
                aggregator.ingest(tp, next_offset, events).await?;
                Ok(Attempt::Done)
            }
        }
    }
}

enum Attempt {
    /// The record's effect is committed, or handed to the aggregator
    Done,
    Failed(AttemptFailure),
    Interrupted,
}

enum AttemptFailure {
    Processing(ProcessingError),
    Aborted(TransactionError),
}
