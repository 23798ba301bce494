//! Bounded exponential backoff for transient oracle failures.
//!
//! Retry lives at the adapter boundary: rate limits, timeouts, and transport
//! hiccups are retried here with exponential delays; permanent errors (auth,
//! malformed output) pass straight through so the caller can mark the
//! affected unit failed instead of burning budget on hopeless calls.

use std::time::Duration;

use crate::error::OracleError;
use crate::oracle::AnswerOracle;
use crate::types::{AnswerDistribution, Question};

/// Retry policy: attempt count and backoff base.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first (so 1 = no retries)
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each subsequent retry
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry number `retry` (1-based).
    fn delay(&self, retry: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(1 << (retry - 1)))
    }
}

/// Run `op`, retrying transient failures per `policy`.
pub fn with_retry<T, F>(policy: RetryPolicy, mut op: F) -> Result<T, OracleError>
where
    F: FnMut() -> Result<T, OracleError>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                std::thread::sleep(policy.delay(attempt));
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// An oracle wrapped with a retry policy. Implements [`AnswerOracle`] itself,
/// so the rest of the system never knows retries happen.
pub struct Retrying<O> {
    inner: O,
    policy: RetryPolicy,
}

impl<O: AnswerOracle> Retrying<O> {
    pub fn new(inner: O, policy: RetryPolicy) -> Self {
        Retrying { inner, policy }
    }
}

impl<O: AnswerOracle> AnswerOracle for Retrying<O> {
    fn query(&self, context: &str, question: &Question) -> Result<AnswerDistribution, OracleError> {
        with_retry(self.policy, || self.inner.query(context, question))
    }

    fn complete(&self, prompt: &str) -> Result<String, OracleError> {
        with_retry(self.policy, || self.inner.complete(prompt))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
        }
    }

    #[test]
    fn test_retries_transient_then_succeeds() {
        let attempts = AtomicUsize::new(0);
        let result = with_retry(fast_policy(3), || {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(OracleError::RateLimited("slow down".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_permanent_not_retried() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), _> = with_retry(fast_policy(5), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(OracleError::Auth("bad key".into()))
        });
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1, "auth errors must not retry");
    }

    #[test]
    fn test_bounded_attempts() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), _> = with_retry(fast_policy(4), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(OracleError::Timeout(1))
        });
        assert!(matches!(result, Err(OracleError::Timeout(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }
}
