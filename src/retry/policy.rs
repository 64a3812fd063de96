use super::backoff::{from_delay, Backoff};
use crate::config::StreamConfig;
use crate::error::{ErrorKind, ProcessingError};
use crate::record::Record;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Failure bookkeeping for one record
///
/// Created on the first failed attempt and dropped on success or when the
/// record is handed to the dead-letter router. Counters live only in memory,
/// so a restarted worker starts every record at attempt zero.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub record: Record,
    /// Number of failed attempts so far
    pub attempt: u32,
    pub last_error: ErrorKind,
    pub last_message: String,
    pub next_eligible_time: Instant,
}

impl RetryState {
    pub fn new(record: Record) -> Self {
        Self {
            record,
            attempt: 0,
            last_error: ErrorKind::Retryable,
            last_message: String::new(),
            next_eligible_time: Instant::now(),
        }
    }

    /// Count one more failed attempt
    pub fn record_failure(&mut self, error: &ProcessingError) {
        self.attempt += 1;
        self.last_error = if error.is_retryable() {
            ErrorKind::Retryable
        } else {
            ErrorKind::Fatal
        };
        self.last_message = error.to_string();
    }

    /// Count a failed attempt that did not come from the processing hook,
    /// such as an aborted commit
    pub fn record_kind(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.attempt += 1;
        self.last_error = kind;
        self.last_message = message.into();
    }

    pub fn schedule(&mut self, delay: Duration) {
        self.next_eligible_time = Instant::now() + delay;
    }
}

/// Outcome of consulting the retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp,
}

/// Decides whether a failed record gets another attempt
pub struct RetryPolicyEngine {
    max_retries: u32,
    backoff: Box<dyn Backoff>,
}

impl std::fmt::Debug for RetryPolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicyEngine")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl RetryPolicyEngine {
    pub fn new(max_retries: u32, backoff: Box<dyn Backoff>) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(
            config.max_retries,
            from_delay(&config.retry_delay, config.jitter_factor),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Non-retryable failures give up immediately; otherwise the record is
    /// retried until `max_retries` attempts have failed.
    pub fn should_retry(&self, state: &RetryState) -> RetryDecision {
        if state.last_error != ErrorKind::Retryable {
            debug!(
                offset = state.record.offset,
                kind = ?state.last_error,
                "Non-retryable failure, giving up"
            );
            return RetryDecision::GiveUp;
        }

        if state.attempt >= self.max_retries {
            debug!(
                offset = state.record.offset,
                attempts = state.attempt,
                max_retries = self.max_retries,
                "Retry budget exhausted"
            );
            return RetryDecision::GiveUp;
        }

        let after = self.backoff.next_delay(state.attempt.saturating_sub(1));
        trace!(
            offset = state.record.offset,
            attempt = state.attempt,
            delay_ms = ?after.as_millis(),
            "Scheduling retry"
        );
        RetryDecision::Retry { after }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryDelay;
    use crate::retry::FixedBackoff;
    use crate::test::TestUtils;

    fn failing_state() -> RetryState {
        RetryState::new(TestUtils::create_test_record("orders", 0, 7, "k", "v"))
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let engine = RetryPolicyEngine::new(3, Box::new(FixedBackoff::new(Duration::from_millis(10))));
        let mut state = failing_state();
        let err = ProcessingError::retryable(anyhow::anyhow!("downstream busy"));

        state.record_failure(&err);
        assert_eq!(
            engine.should_retry(&state),
            RetryDecision::Retry {
                after: Duration::from_millis(10)
            }
        );
        state.record_failure(&err);
        assert!(matches!(engine.should_retry(&state), RetryDecision::Retry { .. }));
        state.record_failure(&err);
        assert_eq!(state.attempt, 3);
        assert_eq!(engine.should_retry(&state), RetryDecision::GiveUp);
    }

    #[test]
    fn test_non_retryable_bypasses_budget() {
        let engine = RetryPolicyEngine::new(10, Box::new(FixedBackoff::new(Duration::ZERO)));
        let mut state = failing_state();
        state.record_failure(&ProcessingError::fatal(anyhow::anyhow!("bad json")));

        assert_eq!(state.attempt, 1);
        assert_eq!(state.last_error, ErrorKind::Fatal);
        assert_eq!(engine.should_retry(&state), RetryDecision::GiveUp);
    }

    #[test]
    fn test_exponential_delay_from_config() {
        let config = StreamConfig {
            max_retries: 5,
            retry_delay: RetryDelay::Exponential {
                base: Duration::from_millis(100),
                cap: Duration::from_millis(300),
            },
            jitter_factor: 0.0,
            ..Default::default()
        };
        let engine = RetryPolicyEngine::from_config(&config);
        let mut state = failing_state();

        let delays: Vec<Duration> = (0..4)
            .filter_map(|_| {
                state.record_kind(ErrorKind::Retryable, "aborted");
                match engine.should_retry(&state) {
                    RetryDecision::Retry { after } => Some(after),
                    RetryDecision::GiveUp => None,
                }
            })
            .collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }
}
