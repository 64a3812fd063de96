//! Retry and backoff functionality
//!
//! Two separate concerns live here:
//!
//! - [`RetryHandle`] retries *transient* broker operations (fetch, append,
//!   commit) with backoff until they succeed, a permanent error occurs, or
//!   shutdown is requested.
//! - [`RetryPolicyEngine`] decides, per failed record, whether the
//!   business logic gets another attempt or the record is handed to the
//!   dead-letter router.

mod backoff;
mod error;
mod policy;

pub use backoff::{from_delay, Backoff, ExponentialBackoff, ExponentialBackoffBuilder, FixedBackoff};
pub use error::RetryError;
pub use policy::{RetryDecision, RetryPolicyEngine, RetryState};

use crate::shutdown;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tokio::select;
use tracing::{debug, trace, warn};

/// Configuration for transient-failure retries
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (None retries until shutdown)
    pub max_retries: Option<u32>,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::builder()
            .initial_delay(self.initial_backoff)
            .max_delay(self.max_backoff)
            .jitter_factor(self.jitter_factor)
            .build()
    }
}

/// Helper for retrying operations with backoff
pub struct RetryHandle<B: Backoff> {
    config: RetryConfig,
    backoff: B,
    attempts: u32,
}

impl RetryHandle<ExponentialBackoff> {
    pub fn from_config(config: RetryConfig) -> Self {
        let backoff = config.backoff();
        Self::new(config, backoff)
    }
}

impl<B: Backoff> RetryHandle<B> {
    pub fn new(config: RetryConfig, backoff: B) -> Self {
        Self {
            config,
            backoff,
            attempts: 0,
        }
    }

    /// Retry an operation on every error
    pub async fn retry<F, Fut, T, E>(
        &mut self,
        operation: F,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: fmt::Debug + fmt::Display,
    {
        self.retry_if(operation, |_| true, shutdown).await
    }

    /// Retry an operation while `is_retryable` accepts its error
    pub async fn retry_if<F, Fut, T, E, R>(
        &mut self,
        mut operation: F,
        is_retryable: R,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: fmt::Debug + fmt::Display,
        R: Fn(&E) -> bool,
    {
        loop {
            if shutdown::is_requested(shutdown) {
                return Err(RetryError::Interrupted);
            }

            self.attempts += 1;
            trace!(attempt = self.attempts, "Executing operation");

            let result = select! {
                result = operation() => result,
                _ = shutdown::requested(shutdown) => {
                    debug!("Operation interrupted by shutdown signal");
                    return Err(RetryError::Interrupted);
                }
            };

            let e = match result {
                Ok(value) => {
                    if self.attempts > 1 {
                        debug!(attempts = self.attempts, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_retryable(&e) {
                return Err(RetryError::Permanent(e));
            }

            if let Some(max) = self.config.max_retries {
                if self.attempts >= max {
                    warn!(
                        attempts = self.attempts,
                        error = %e,
                        "Maximum retry attempts exceeded"
                    );
                    return Err(RetryError::MaxRetriesExceeded {
                        attempts: self.attempts,
                        last: e,
                    });
                }
            }

            let delay = self.backoff.next_delay(self.attempts - 1);
            warn!(
                attempt = self.attempts,
                delay_ms = ?delay.as_millis(),
                error = %e,
                "Operation failed, retrying after delay"
            );

            select! {
                _ = tokio::time::sleep(delay) => continue,
                _ = shutdown::requested(shutdown) => {
                    debug!("Retry interrupted by shutdown signal");
                    return Err(RetryError::Interrupted);
                }
            }
        }
    }

    /// Reset the retry counter
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Get the current attempt count
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: Option<u32>) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn test_retry_success() -> anyhow::Result<()> {
        let mut retry = RetryHandle::from_config(fast_config(Some(5)));
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = retry
            .retry(
                || {
                    let value = counter_clone.clone();
                    async move {
                        let attempts = value.fetch_add(1, Ordering::SeqCst);
                        if attempts < 2 {
                            Err("not yet")
                        } else {
                            Ok("success")
                        }
                    }
                },
                &mut shutdown_rx,
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(retry.attempts(), 3);

        drop(shutdown_tx);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_max_attempts() -> anyhow::Result<()> {
        let mut retry = RetryHandle::from_config(fast_config(Some(2)));
        let (_shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let result: Result<(), _> = retry
            .retry(|| async { Err("always fails") }, &mut shutdown_rx)
            .await;

        assert!(matches!(
            result,
            Err(RetryError::MaxRetriesExceeded { attempts: 2, .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() -> anyhow::Result<()> {
        let mut retry = RetryHandle::from_config(fast_config(None));
        let (_shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let result: Result<(), _> = retry
            .retry_if(
                || async { Err("fenced") },
                |e: &&str| *e != "fenced",
                &mut shutdown_rx,
            )
            .await;

        assert!(matches!(result, Err(RetryError::Permanent("fenced"))));
        assert_eq!(retry.attempts(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_shutdown() -> anyhow::Result<()> {
        let mut retry = RetryHandle::from_config(fast_config(None));
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let handle = tokio::spawn(async move {
            retry
                .retry(
                    || async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Err::<(), _>("never succeeds")
                    },
                    &mut shutdown_rx,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true)?;

        let result = handle.await?;
        assert!(matches!(result, Err(RetryError::Interrupted)));
        Ok(())
    }
}
