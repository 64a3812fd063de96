use crate::config::RetryDelay;
use rand::Rng;
use std::time::Duration;
use tracing::trace;

/// Trait defining backoff behavior
pub trait Backoff: Send + Sync {
    /// Calculate the delay before retry number `attempt` (zero-based)
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Build the backoff strategy a [`RetryDelay`] describes
pub fn from_delay(delay: &RetryDelay, jitter_factor: f64) -> Box<dyn Backoff> {
    match delay {
        RetryDelay::Fixed { delay } => Box::new(FixedBackoff::new(*delay)),
        RetryDelay::Exponential { base, cap } => Box::new(
            ExponentialBackoff::builder()
                .initial_delay(*base)
                .max_delay(*cap)
                .jitter_factor(jitter_factor)
                .build(),
        ),
    }
}

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    pub fn builder() -> ExponentialBackoffBuilder {
        ExponentialBackoffBuilder::default()
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let exp_delay = base * self.multiplier.powi(attempt.min(63) as i32);

        // Cap before jitter so jitter never pushes past the cap's neighbourhood
        let max_ms = self.max_delay.as_millis() as f64;
        let capped_delay = exp_delay.min(max_ms);

        let jitter_range = capped_delay * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let final_delay = (capped_delay + jitter).clamp(0.0, max_ms);

        trace!(
            attempt = attempt,
            base_delay_ms = capped_delay,
            jitter_ms = jitter,
            final_delay_ms = final_delay,
            "Calculated backoff delay"
        );

        Duration::from_millis(final_delay as u64)
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        self.calculate_delay(attempt)
    }
}

/// Builder for ExponentialBackoff
#[derive(Debug)]
pub struct ExponentialBackoffBuilder {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl Default for ExponentialBackoffBuilder {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoffBuilder {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter_factor: self.jitter_factor,
        }
    }
}

/// Fixed backoff implementation
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Backoff for FixedBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        trace!(attempt = attempt, delay_ms = ?self.delay.as_millis(), "Fixed backoff delay");
        self.delay
    }
}
