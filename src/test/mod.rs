//! Test utilities and mock implementations for testing the stream processor


use crate::record::Record;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    /// Create a record as if it had been read from `topic`/`partition` at `offset`
    pub fn create_test_record(
        topic: &str,
        partition: u32,
        offset: i64,
        key: &str,
        value: &str,
    ) -> Record {
        Record {
            key: Bytes::copy_from_slice(key.as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
            headers: Vec::new(),
            topic: topic.to_string(),
            partition,
            offset,
            timestamp: Self::at_secs(offset),
        }
    }

    /// Consecutive records starting at offset 0
    pub fn create_test_records(topic: &str, partition: u32, count: usize) -> Vec<Record> {
        (0..count)
            .map(|i| {
                Self::create_test_record(
                    topic,
                    partition,
                    i as i64,
                    &format!("key-{}", i),
                    &format!("value-{}", i),
                )
            })
            .collect()
    }

    /// A fixed UTC instant `secs` seconds after the epoch
    pub fn at_secs(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Route `tracing` output through the test harness, honouring `RUST_LOG`
    #[cfg(test)]
    pub fn init_logging() {
        static INIT: std::sync::Once = std::sync::Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

/// Assertion helpers for tests
pub mod assertions {
    use super::*;

    pub async fn wait_for_condition<F>(mut check: F, timeout: Duration) -> anyhow::Result<()>
    where
        F: FnMut() -> bool,
    {
        let start = std::time::Instant::now();
        while !check() {
            if start.elapsed() > timeout {
                anyhow::bail!("Condition not met within timeout");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_record() {
        let record = TestUtils::create_test_record("orders", 1, 5, "k", "v");
        assert_eq!(record.topic, "orders");
        assert_eq!(record.partition, 1);
        assert_eq!(record.offset, 5);
        assert_eq!(record.key.as_ref(), b"k");
        assert_eq!(record.timestamp, TestUtils::at_secs(5));
    }

    #[test]
    fn test_create_test_records() {
        let records = TestUtils::create_test_records("orders", 0, 3);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].offset, 2);
        assert_eq!(records[2].value.as_ref(), b"value-2");
    }

    #[tokio::test]
    async fn test_wait_for_condition_times_out() {
        let result = assertions::wait_for_condition(|| false, Duration::from_millis(30)).await;
        assert!(result.is_err());
    }
}
