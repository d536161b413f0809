//! Exponential backoff for transport failures.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap for the exponential growth.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Spread each delay by +/- 25%.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = (self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(exponent))
        .min(self.max_delay.as_millis() as f64);

        let millis = if self.jitter {
            millis * (0.75 + rand::random::<f64>() * 0.5)
        } else {
            millis
        };

        Duration::from_millis(millis as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Runs an operation, retrying the failures a predicate selects.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails with an error `should_retry`
    /// rejects, or the retries are used up.
    ///
    /// Returns the last error when retries run out.
    pub async fn execute<F, Fut, T, E, C>(&self, operation: F, should_retry: C) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut retries = 0;

        loop {
            let err = match operation().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!(retries, "Operation succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !should_retry(&err) {
                return Err(err);
            }
            if retries >= self.config.max_retries {
                warn!(attempts = retries + 1, "Giving up: {}", err);
                return Err(err);
            }

            let delay = self.config.delay_for_attempt(retries);
            retries += 1;
            warn!(retry = retries, ?delay, "Attempt failed: {}", err);
            sleep(delay).await;
        }
    }
}
