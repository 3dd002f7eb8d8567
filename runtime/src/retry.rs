//! Retry with exponential backoff for effect result streams.
//!
//! A failed source is re-created from its factory and re-run from the
//! beginning. Before each new attempt the failure is classified: terminal
//! failures propagate immediately, transient ones wait
//! `initial_delay * multiplier^(attempt - 1)` and try again.
//!
//! `max_retries` is the total number of attempts, first one included: a
//! policy with `max_retries = 3` runs the source at most three times and
//! waits twice.
//!
//! # Example
//!
//! ```rust
//! use command_flow_core::effect::{fail, just};
//! use command_flow_core::error::EffectError;
//! use command_flow_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use futures::StreamExt;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let policy = RetryPolicy::builder()
//!     .max_retries(3)
//!     .initial_delay(Duration::from_millis(1))
//!     .build();
//!
//! let calls = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&calls);
//! let items: Vec<_> = retry_with_backoff(policy, move || {
//!     if counter.fetch_add(1, Ordering::SeqCst) == 0 {
//!         fail(EffectError::http(503, "unavailable"))
//!     } else {
//!         just(42)
//!     }
//! })
//! .collect()
//! .await;
//!
//! assert_eq!(items, vec![Ok(42)]);
//! assert_eq!(calls.load(Ordering::SeqCst), 2);
//! # });
//! ```

use crate::metrics::{counter, names};
use command_flow_core::effect::ResultStream;
use command_flow_core::error::EffectError;
use futures::StreamExt;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 500ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
/// - `jitter`: off
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first
    pub max_retries: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Whether an error is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// May succeed if tried again
    Transient,
    /// Will fail the same way again
    Terminal,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then run the source again
    Retry {
        /// Backoff before the next attempt
        delay: Duration,
    },
    /// Propagate the error
    GiveUp,
}

/// Classify an effect failure.
///
/// Terminal: missing credentials, no network path, 4xx other than 408 and
/// 429, 501 and 505. Everything else is transient.
#[must_use]
pub const fn classify(error: &EffectError) -> ErrorClass {
    match error {
        EffectError::AuthenticationUnavailable(_) | EffectError::Unreachable(_) => {
            ErrorClass::Terminal
        }
        EffectError::Http { status, .. } => match *status {
            408 | 429 => ErrorClass::Transient,
            400..=499 | 501 | 505 => ErrorClass::Terminal,
            _ => ErrorClass::Transient,
        },
        EffectError::Timeout(_) | EffectError::Failed(_) => ErrorClass::Transient,
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: Some(3),
            initial_delay: Some(Duration::from_millis(500)),
            max_delay: Some(Duration::from_secs(30)),
            multiplier: Some(2.0),
            jitter: false,
        }
    }

    /// Attempts actually allowed; zero is treated as a single attempt.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Backoff after failed attempt number `attempt` (1-based).
    ///
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if scaled.is_finite() && scaled < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(scaled.max(0.0))
        } else {
            self.max_delay
        };

        if self.jitter {
            capped.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            capped
        }
    }

    /// Decide what follows failed attempt number `attempt`.
    #[must_use]
    pub fn decide(&self, error: &EffectError, attempt: u32) -> RetryDecision {
        if classify(error) == ErrorClass::Terminal || attempt >= self.attempts() {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                delay: self.delay_for_attempt(attempt),
            }
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
    jitter: bool,
}

impl RetryPolicyBuilder {
    /// Set the total number of attempts.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the delay before the second attempt.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Randomize delays.
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(3),
            initial_delay: self.initial_delay.unwrap_or(Duration::from_millis(500)),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(30)),
            multiplier: self.multiplier.unwrap_or(2.0),
            jitter: self.jitter,
        }
    }
}

/// Re-run a failing result stream with exponential backoff.
///
/// `factory` creates a fresh source for every attempt. Values a failed
/// attempt already yielded stay delivered; the retry starts the source over.
/// When retries stop, the last error is yielded as the final item.
pub fn retry_with_backoff<T, F>(policy: RetryPolicy, factory: F) -> ResultStream<T>
where
    T: Send + 'static,
    F: Fn() -> ResultStream<T> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut attempt: u32 = 1;
        loop {
            let mut source = factory();
            let mut failure = None;
            while let Some(item) = source.next().await {
                match item {
                    Ok(value) => {
                        yield Ok(value);
                    }
                    Err(error) => {
                        failure = Some(error);
                        break;
                    }
                }
            }
            drop(source);

            let Some(error) = failure else {
                if attempt > 1 {
                    tracing::info!(attempt, "Effect succeeded after retry");
                }
                break;
            };

            match policy.decide(&error, attempt) {
                RetryDecision::Retry { delay } => {
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Effect failed, retrying..."
                    );
                    counter!(names::RETRY_ATTEMPTS).increment(1);
                    sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => {
                    log_give_up(&error, attempt);
                    yield Err(error);
                    break;
                }
            }
        }
    })
}

/// Retry a single-valued async operation with exponential backoff.
///
/// # Errors
///
/// Returns the last error once the policy gives up.
pub async fn retry_future<T, F, Fut>(
    policy: RetryPolicy,
    mut operation: F,
) -> Result<T, EffectError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EffectError>>,
{
    let mut attempt: u32 = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => match policy.decide(&error, attempt) {
                RetryDecision::Retry { delay } => {
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Operation failed, retrying..."
                    );
                    counter!(names::RETRY_ATTEMPTS).increment(1);
                    sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => {
                    log_give_up(&error, attempt);
                    return Err(error);
                }
            },
        }
    }
}

fn log_give_up(error: &EffectError, attempt: u32) {
    counter!(names::RETRY_EXHAUSTED).increment(1);
    if classify(error) == ErrorClass::Terminal {
        tracing::warn!(attempt, error = %error, "Error is not retryable, failing immediately");
    } else {
        tracing::error!(attempt, error = %error, "Effect failed after max retries");
    }
}
