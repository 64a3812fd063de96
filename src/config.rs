//! Processor configuration

use crate::broker::IsolationLevel;
use crate::error::ConfigError;
use crate::monitoring::MonitoringConfig;
use crate::retry::RetryConfig;
use serde::Deserialize;
use std::time::Duration;

/// Delay between attempts at processing a failing record
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDelay {
    Fixed { delay: Duration },
    Exponential { base: Duration, cap: Duration },
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Fixed {
            delay: Duration::from_secs(2),
        }
    }
}

/// Where a partition worker starts when its group has no committed offset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Start from the oldest available record
    #[default]
    Earliest,
    /// Start after the newest record
    Latest,
}

/// Configuration for the stream processor
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Topic to consume
    pub input_topic: String,
    /// Consumer group whose offsets are committed with each transaction
    pub group_id: String,
    /// Topic that receives window aggregates
    pub output_topic: String,
    /// Topic that receives dead-lettered records
    pub dlq_topic: String,
    /// Base identity for transactional producers; made unique per worker
    pub transactional_identity: String,
    /// Visibility of uncommitted records to this processor's fetches
    pub isolation_level: IsolationLevel,
    /// Total attempts at a record before it is dead-lettered
    pub max_retries: u32,
    /// Delay strategy between attempts
    pub retry_delay: RetryDelay,
    /// Jitter applied to exponential retry delays (0.0 to 1.0)
    pub jitter_factor: f64,
    /// Size of each tumbling window
    pub window_size: Duration,
    /// How often the window clock ticks
    pub tick_interval: Duration,
    /// Maximum time a single fetch blocks
    pub fetch_timeout: Duration,
    /// Delay between broker polls while a fetch waits for data
    pub poll_interval: Duration,
    /// Maximum records requested per broker fetch
    pub max_poll_records: usize,
    /// Starting point when no offset is committed
    pub start_position: StartPosition,
    /// Maximum number of partitions processed concurrently
    pub max_concurrent_partitions: Option<u32>,
    /// Backoff for transient broker failures
    pub transient_retry: RetryConfig,
    /// Monitoring configuration
    pub monitoring: MonitoringConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            input_topic: String::new(),
            group_id: String::new(),
            output_topic: String::new(),
            dlq_topic: String::new(),
            transactional_identity: String::new(),
            isolation_level: IsolationLevel::ReadCommitted,
            max_retries: 3,
            retry_delay: RetryDelay::default(),
            jitter_factor: 0.1,
            window_size: Duration::from_secs(10),
            tick_interval: Duration::from_secs(1),
            fetch_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(20),
            max_poll_records: 100,
            start_position: StartPosition::Earliest,
            max_concurrent_partitions: None,
            transient_retry: RetryConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl StreamConfig {
    /// Reject configurations the processor cannot run safely with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("input_topic", &self.input_topic),
            ("group_id", &self.group_id),
            ("dlq_topic", &self.dlq_topic),
            ("transactional_identity", &self.transactional_identity),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError(format!("{} must not be empty", name)));
            }
        }

        if self.dlq_topic == self.input_topic {
            return Err(ConfigError(
                "dlq_topic must differ from input_topic".to_string(),
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError("max_retries must be at least 1".to_string()));
        }
        if self.window_size.is_zero() || self.window_size.as_millis() == 0 {
            return Err(ConfigError(
                "window_size must be at least one millisecond".to_string(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError("tick_interval must be positive".to_string()));
        }
        if self.max_poll_records == 0 {
            return Err(ConfigError("max_poll_records must be positive".to_string()));
        }
        if let RetryDelay::Exponential { base, cap } = &self.retry_delay {
            if cap < base {
                return Err(ConfigError(format!(
                    "exponential retry cap {:?} is below base {:?}",
                    cap, base
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError("jitter_factor must be within 0.0..=1.0".to_string()));
        }
        if self.max_concurrent_partitions == Some(0) {
            return Err(ConfigError(
                "max_concurrent_partitions must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Window output topic, required only when aggregating
    pub fn validate_windowed(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.output_topic.trim().is_empty() {
            return Err(ConfigError(
                "output_topic must not be empty for windowed aggregation".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> StreamConfig {
        StreamConfig {
            input_topic: "clicks".to_string(),
            group_id: "click-counter".to_string(),
            output_topic: "clicks-per-window".to_string(),
            dlq_topic: "clicks-dlq".to_string(),
            transactional_identity: "click-counter".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_retry_budget() {
        assert_eq!(StreamConfig::default().max_retries, 3);
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        let mut config = valid();
        config.max_retries = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.transactional_identity = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.retry_delay = RetryDelay::Exponential {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(1),
        };
        assert!(config.validate().is_err());

        let mut config = valid();
        config.window_size = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.output_topic.clear();
        assert!(config.validate().is_ok());
        assert!(config.validate_windowed().is_err());
    }

    #[test]
    fn test_deserializes_from_json() -> anyhow::Result<()> {
        let config: StreamConfig = serde_json::from_str(
            r#"{
                "input_topic": "orders",
                "group_id": "order-processing-group",
                "dlq_topic": "orders-dlq",
                "transactional_identity": "order-processor",
                "isolation_level": "read_uncommitted",
                "max_retries": 5,
                "retry_delay": {"exponential": {"base": {"secs": 1, "nanos": 0}, "cap": {"secs": 30, "nanos": 0}}}
            }"#,
        )?;

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.isolation_level, IsolationLevel::ReadUncommitted);
        assert_eq!(
            config.retry_delay,
            RetryDelay::Exponential {
                base: Duration::from_secs(1),
                cap: Duration::from_secs(30)
            }
        );
        assert_eq!(config.window_size, Duration::from_secs(10));
        config.validate()?;
        Ok(())
    }
}
