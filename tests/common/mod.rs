// tests/common/mod.rs
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use go_zoom_stream::broker::{FetchResult, OffsetCommit, ProducerId, TransactionOutcome};
use go_zoom_stream::error::BrokerError;
use go_zoom_stream::monitoring::MonitoringConfig;
use go_zoom_stream::{
    BrokerClient, Clock, InMemoryBroker, IsolationLevel, ProcessingError, ProducerRecord, Record,
    RecordProcessor, RetryDelay, StreamConfig, TopicPartition,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn create_test_config() -> StreamConfig {
    StreamConfig {
        input_topic: "orders".to_string(),
        group_id: "order-group".to_string(),
        output_topic: "order-totals".to_string(),
        dlq_topic: "orders-dlq".to_string(),
        transactional_identity: "order-processor".to_string(),
        max_retries: 3,
        retry_delay: RetryDelay::Fixed {
            delay: Duration::from_millis(5),
        },
        window_size: Duration::from_secs(10),
        tick_interval: Duration::from_millis(20),
        fetch_timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(5),
        monitoring: MonitoringConfig {
            enabled: true,
            channel_size: 1000,
            metrics_interval: Duration::from_secs(60),
        },
        ..Default::default()
    }
}

pub fn at_secs(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub async fn produce_values(
    broker: &InMemoryBroker,
    partition: u32,
    values: &[(&str, &str, i64)],
) -> Result<()> {
    for (key, value, secs) in values {
        broker
            .produce(
                ProducerRecord::new("orders", key.to_string(), value.to_string())
                    .with_partition(partition)
                    .with_timestamp(at_secs(*secs)),
            )
            .await?;
    }
    Ok(())
}

pub async fn committed(broker: &InMemoryBroker, partition: u32) -> Result<Option<i64>> {
    Ok(broker
        .committed_offset("order-group", &TopicPartition::new("orders", partition))
        .await?)
}

pub async fn wait_until<F, Fut>(mut check: F, timeout: Duration) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while !check().await {
        if start.elapsed() > timeout {
            anyhow::bail!("Condition not met within timeout");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Emits every input record twice: once to `order-totals`, once to `order-audit`
#[derive(Debug, Clone, Default)]
pub struct FanOutProcessor;

#[async_trait]
impl RecordProcessor for FanOutProcessor {
    async fn process(&self, record: &Record) -> Result<Vec<ProducerRecord>, ProcessingError> {
        Ok(vec![
            ProducerRecord::new("order-totals", record.key.clone(), record.value.clone()),
            ProducerRecord::new("order-audit", record.key.clone(), record.value.clone()),
        ])
    }
}

/// In-memory broker whose commits can be made to never return
///
/// Aborting the task stuck in a commit leaves its transaction open on the
/// broker, the same state a process crash right before commit leaves behind.
#[derive(Debug, Clone)]
pub struct CrashingBroker {
    pub inner: InMemoryBroker,
    crash_on_commit: Arc<AtomicBool>,
}

impl CrashingBroker {
    pub fn new(inner: InMemoryBroker) -> Self {
        Self {
            inner,
            crash_on_commit: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn crash_on_commit(&self, value: bool) {
        self.crash_on_commit.store(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl BrokerClient for CrashingBroker {
    async fn partitions(&self, topic: &str) -> Result<Vec<u32>, BrokerError> {
        self.inner.partitions(topic).await
    }

    async fn fetch(
        &self,
        tp: &TopicPartition,
        offset: i64,
        max_records: usize,
        isolation: IsolationLevel,
    ) -> Result<FetchResult, BrokerError> {
        self.inner.fetch(tp, offset, max_records, isolation).await
    }

    async fn end_offset(&self, tp: &TopicPartition) -> Result<i64, BrokerError> {
        self.inner.end_offset(tp).await
    }

    async fn committed_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
    ) -> Result<Option<i64>, BrokerError> {
        self.inner.committed_offset(group_id, tp).await
    }

    async fn commit_offset(
        &self,
        group_id: &str,
        tp: &TopicPartition,
        offset: i64,
    ) -> Result<(), BrokerError> {
        self.inner.commit_offset(group_id, tp, offset).await
    }

    async fn produce(&self, record: ProducerRecord) -> Result<(u32, i64), BrokerError> {
        self.inner.produce(record).await
    }

    async fn init_producer(&self, transactional_id: &str) -> Result<u32, BrokerError> {
        self.inner.init_producer(transactional_id).await
    }

    async fn append(
        &self,
        producer: &ProducerId,
        sequence: u64,
        record: ProducerRecord,
    ) -> Result<(u32, i64), BrokerError> {
        self.inner.append(producer, sequence, record).await
    }

    async fn end_transaction(
        &self,
        producer: &ProducerId,
        outcome: TransactionOutcome,
        offsets: &OffsetCommit,
    ) -> Result<(), BrokerError> {
        if outcome == TransactionOutcome::Commit && self.crash_on_commit.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.end_transaction(producer, outcome, offsets).await
    }
}
