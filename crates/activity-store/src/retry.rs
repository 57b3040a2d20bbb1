//! Transient-fault retry policy
//!
//! A higher-order wrapper executing a store operation with exponential
//! backoff and jitter on classified transient failures:
//! - fault classification goes through [`StoreError::is_transient`], an
//!   explicit predicate, never a broad catch
//! - fatal faults propagate immediately, unwrapped
//! - exhausting the attempt budget re-returns the last transient fault
//! - cancellation is honored before every attempt and during every backoff
//!   wait, surfacing as [`StoreError::Cancelled`]

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{StoreConfig, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES};
use crate::error::{Result, StoreError};

/// Jitter band applied to every computed backoff delay
const JITTER_LOW: f64 = 0.75;
/// Upper bound of the jitter band
const JITTER_HIGH: f64 = 1.25;

/// Retry policy for store interactions.
///
/// `max_retries` is the total attempt budget: the operation runs at most
/// `max_retries` times, with backoff between attempts. Delay for the n-th
/// failed attempt is `min(max_delay, base_delay * 2^(n-1))` scaled by a
/// jitter factor drawn uniformly from `[0.75, 1.25]`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the default budget (5 attempts, 100ms base,
    /// 5s cap)
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a policy from the retry fields of a [`StoreConfig`]
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }

    /// Set the total attempt budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base backoff delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the backoff cap
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// The configured attempt budget
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Backoff delay after the `attempt`-th failure (1-indexed), jittered
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // exponent capped to keep 2^n finite for degenerate budgets
        let exponent = attempt.saturating_sub(1).min(20);
        let raw = self.base_delay.as_secs_f64() * 2f64.powi(exponent as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(JITTER_LOW..=JITTER_HIGH);
        Duration::from_secs_f64(capped * jitter)
    }

    /// Execute `op` under this policy.
    ///
    /// `op` is invoked once per attempt. Success returns immediately; a
    /// transient failure sleeps and retries while budget remains; anything
    /// else propagates as-is. A cancellation request aborts before the next
    /// attempt or mid-backoff and returns [`StoreError::Cancelled`] — never
    /// a retry-exhaustion error.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            attempt += 1;

            match op().await {
                Ok(value) => return Ok(value),
                Err(StoreError::Cancelled) => return Err(StoreError::Cancelled),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        budget = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient store fault, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}
