// Retry logic with exponential backoff and optional jitter
use std::time::Duration;
use tokio::time::sleep;
use tokio_retry::strategy::jitter;
use tracing::{debug, warn};

/// How a failing query is retried before its error surfaces
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in `[0, 1)`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(1000), // Start with 1 second
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0, // Double each time
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Total attempts a failing query gets
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Backoff before retry number `retry` (1-based), jitter not applied
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry.saturating_sub(1) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Execute a function with retry logic
///
/// Every error is retried. After `max_retries` retries the last error is
/// returned, so a failure always means `policy.attempts()` calls were made.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut retry = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if retry > 0 {
                    debug!("Query succeeded after {} retries", retry);
                }
                return Ok(result);
            }
            Err(err) => {
                retry += 1;

                if retry > policy.max_retries {
                    warn!("Query failed after {} attempts: {}", policy.attempts(), err);
                    return Err(err);
                }

                let mut delay = policy.delay_for(retry);
                if policy.jitter {
                    delay = jitter(delay);
                }

                warn!(
                    "Query failed (attempt {}/{}): {}. Retrying in {}ms...",
                    retry,
                    policy.attempts(),
                    err,
                    delay.as_millis()
                );

                sleep(delay).await;
            }
        }
    }
}
