use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use super::{Notifier, NotifyContext};
use crate::error::NotifyError;
use crate::types::Alert;

/// Exponential backoff policy for the retry stage.
///
/// Retries are bounded both by attempt count and by total elapsed time.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Give up rather than sleep past this much total time.
    pub max_elapsed: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            max_attempts: 10,
            max_elapsed: Duration::from_secs(5 * 60),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given failed attempt (1-based).
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay_millis = (self.initial_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(delay_millis).min(self.max_delay)
    }

    /// Returns true if another attempt may follow attempt number `attempt`.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Re-invokes the inner stage on retryable failures with backoff.
///
/// Permanent failures are returned immediately. When the budget runs out
/// the last failure is wrapped in [`NotifyError::RetriesExhausted`].
#[derive(Debug)]
pub struct Retry<N> {
    config: RetryConfig,
    inner: N,
}

impl<N> Retry<N> {
    /// Wraps `inner` with the given backoff policy.
    pub const fn new(config: RetryConfig, inner: N) -> Self {
        Self { config, inner }
    }
}

#[async_trait]
impl<N: Notifier> Notifier for Retry<N> {
    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<bool, NotifyError> {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.inner.notify(ctx, alerts).await {
                Ok(delivered) => {
                    if attempt > 1 {
                        info!(receiver = %ctx.receiver, group = %ctx.group_key, attempt, "notification succeeded after retry");
                    }
                    return Ok(delivered);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    let delay = self.config.delay_for_attempt(attempt);
                    let over_budget = started.elapsed() + delay > self.config.max_elapsed;
                    if !self.config.should_retry(attempt) || over_budget {
                        return Err(NotifyError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }

                    debug!(
                        receiver = %ctx.receiver,
                        group = %ctx.group_key,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "notification failed, retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::notify::testing::*;

    fn fast() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_attempts: 4,
            max_elapsed: Duration::from_secs(60),
        }
    }

    mod config_tests {
        use super::*;

        #[test]
        fn delay_grows_and_caps() {
            let config = RetryConfig {
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                backoff_multiplier: 2.0,
                ..RetryConfig::default()
            };

            assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
            assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
            assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
            assert_eq!(config.delay_for_attempt(6), Duration::from_secs(32));
            assert_eq!(config.delay_for_attempt(7), Duration::from_secs(60));
        }

        #[test]
        fn attempts_are_bounded() {
            let config = RetryConfig {
                max_attempts: 3,
                ..RetryConfig::default()
            };
            assert!(config.should_retry(1));
            assert!(config.should_retry(2));
            assert!(!config.should_retry(3));
        }
    }

    mod stage_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn transient_failures_are_retried() {
            let recorder = Arc::new(Recorder::failing_with(vec![
                NotifyError::retryable("w", "timeout"),
                NotifyError::retryable("w", "timeout"),
            ]));
            let stage = Retry::new(fast(), Arc::clone(&recorder));

            let started = Instant::now();
            assert!(stage.notify(&context("team"), &[alert(&[("a", "1")])]).await.unwrap());
            assert_eq!(recorder.calls(), 3);
            assert_eq!(started.elapsed(), Duration::from_millis(300));
        }

        #[tokio::test(start_paused = true)]
        async fn permanent_failure_is_not_retried() {
            let recorder = Arc::new(Recorder::failing_with(vec![NotifyError::permanent("w", "400")]));
            let stage = Retry::new(fast(), Arc::clone(&recorder));

            let err = stage.notify(&context("team"), &[alert(&[("a", "1")])]).await.unwrap_err();
            assert_eq!(err, NotifyError::permanent("w", "400"));
            assert_eq!(recorder.calls(), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn gives_up_after_max_attempts() {
            let recorder = Arc::new(Recorder::failing_with(
                (0..10).map(|_| NotifyError::retryable("w", "503")).collect(),
            ));
            let stage = Retry::new(fast(), Arc::clone(&recorder));

            let err = stage.notify(&context("team"), &[alert(&[("a", "1")])]).await.unwrap_err();
            assert_eq!(
                err,
                NotifyError::RetriesExhausted {
                    attempts: 4,
                    last: Box::new(NotifyError::retryable("w", "503")),
                }
            );
            assert_eq!(recorder.calls(), 4);
        }

        #[tokio::test(start_paused = true)]
        async fn gives_up_when_elapsed_budget_runs_out() {
            let recorder = Arc::new(Recorder::failing_with(
                (0..10).map(|_| NotifyError::retryable("w", "503")).collect(),
            ));
            let config = RetryConfig {
                max_attempts: 100,
                max_elapsed: Duration::from_millis(250),
                ..fast()
            };
            let stage = Retry::new(config, Arc::clone(&recorder));

            let started = Instant::now();
            let err = stage.notify(&context("team"), &[alert(&[("a", "1")])]).await.unwrap_err();
            assert!(matches!(err, NotifyError::RetriesExhausted { attempts: 2, .. }));
            assert!(started.elapsed() <= Duration::from_millis(250));
        }
    }
}
