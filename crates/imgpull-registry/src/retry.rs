//! Retry policy and executor.

use std::future::Future;
use std::time::Duration;

use crate::error::{RegistryError, Result};

/// Bounded exponential backoff.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use imgpull_registry::RetryPolicy;
///
/// let policy = RetryPolicy::new(4).with_backoff(Duration::from_millis(100), Duration::from_millis(250));
/// assert_eq!(policy.backoff(1), Duration::from_millis(100));
/// assert_eq!(policy.backoff(2), Duration::from_millis(200));
/// assert_eq!(policy.backoff(3), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_backoff: Duration,
    /// Upper bound on any delay.
    pub max_backoff: Duration,
    /// Growth factor between delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with `max_attempts` and default delays.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Sets the initial and maximum delay.
    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Retries immediately, without sleeping.
    #[must_use]
    pub const fn without_backoff(mut self) -> Self {
        self.initial_backoff = Duration::ZERO;
        self.max_backoff = Duration::ZERO;
        self
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// True if another attempt may follow attempt `attempt`.
    #[must_use]
    pub const fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempts are spent. The closure receives the 1-based attempt
/// number. The last error is returned unchanged.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, RegistryError>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && policy.allows_retry(attempt) => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    what,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "request failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_without_backoff() {
        let policy = RetryPolicy::new(5).without_backoff();
        assert_eq!(policy.backoff(3), Duration::ZERO);
        assert!(policy.allows_retry(4));
        assert!(!policy.allows_retry(5));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3).without_backoff();
        let value = retry(&policy, "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(RegistryError::Http {
                        status: 502,
                        url: "http://registry/v2/".to_string(),
                    })
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5).without_backoff();
        let err = retry(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(RegistryError::ManifestNotFound {
                    repository: "library/alpine".to_string(),
                    reference: "nope".to_string(),
                })
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RegistryError::ManifestNotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2).without_backoff();
        let err = retry(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(RegistryError::Timeout {
                    url: "http://registry/v2/".to_string(),
                })
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RegistryError::Timeout { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
