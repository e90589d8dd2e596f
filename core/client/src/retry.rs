//! Backoff policy for client downloads.
//!
//! Transport failures, timeouts and transient HTTP statuses are retried with
//! exponentially growing, jittered delays; anything else fails at once.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use bwsync_common::{Error, Result};

const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(2);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// How often and how patiently a download is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
}

impl RetryPolicy {
    /// Retry up to `max_retries` times after the first attempt.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }

    /// Set the delay before the first retry.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Delay before retry number `retry` (starting at 1): doubled each time,
    /// capped, with "equal jitter" so the wait lies in `[d/2, d]`.
    pub fn delay_before(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let full = self
            .initial_delay
            .saturating_mul(1 << exponent)
            .min(MAX_DELAY.max(self.initial_delay));
        let half = full / 2;
        half + half.mul_f64(rand::random::<f64>())
    }

    /// Run `operation`, retrying transient failures.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            match operation().await {
                Err(err) if is_transient(&err) && retry < self.max_retries => {
                    retry += 1;
                    let delay = self.delay_before(retry);
                    warn!(
                        "Download attempt {} failed: {}. Retrying in {:?}",
                        retry, err, delay
                    );
                    sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Whether a download failure is worth another attempt.
pub fn is_transient(err: &Error) -> bool {
    matches!(err, Error::Network(_) | Error::Timeout { .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy::new(10).with_initial_delay(Duration::from_secs(2));

        let first = policy.delay_before(1);
        assert!(first >= Duration::from_secs(1) && first <= Duration::from_secs(2));

        let third = policy.delay_before(3);
        assert!(third >= Duration::from_secs(4) && third <= Duration::from_secs(8));

        let late = policy.delay_before(12);
        assert!(late >= MAX_DELAY / 2 && late <= MAX_DELAY);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let mut attempts = 0;
        let policy = RetryPolicy::new(3).with_initial_delay(Duration::from_millis(1));

        let result = policy
            .run(|| {
                attempts += 1;
                let current = attempts;
                async move {
                    match current {
                        1 => Err(Error::Network("connection reset".to_string())),
                        2 => Err(Error::Timeout {
                            command: "GET bw.zip".to_string(),
                            after: Duration::from_secs(100),
                        }),
                        _ => Ok(current),
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_immediately() {
        let mut attempts = 0;
        let result: Result<()> = RetryPolicy::default()
            .run(|| {
                attempts += 1;
                async { Err(Error::Download("HTTP 404".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(Error::Download(_))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let mut attempts = 0;
        let policy = RetryPolicy::new(2).with_initial_delay(Duration::from_millis(1));

        let result: Result<()> = policy
            .run(|| {
                attempts += 1;
                async { Err(Error::Network("unreachable".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(attempts, 3);
    }
}
