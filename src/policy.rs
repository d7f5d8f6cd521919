//! Retry policies and predicates for handling transient failures.
//!
//! Each request class (read, write, upload) has its own [`RetryPolicy`]
//! with an attempt cap, a backoff base and a per-attempt timeout. Whether a
//! given failure is retried at all is decided by a [`RetryPredicate`].

use crate::request::RequestClass;
use crate::Error;
use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff for one request class.
///
/// # Examples
///
/// ```
/// use intake_client::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 3,
///     base_delay: Duration::from_millis(100),
///     timeout: Duration::from_secs(5),
///     ..RetryPolicy::reads()
/// };
///
/// // 100ms after the first failure, 200ms after the second, then give up.
/// assert_eq!(policy.delay_after(1, false), Some(Duration::from_millis(100)));
/// assert_eq!(policy.delay_after(2, false), Some(Duration::from_millis(200)));
/// assert_eq!(policy.delay_after(3, false), None);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Values below 1 act as 1.
    pub max_attempts: usize,
    /// Delay after the first failure; doubles after each subsequent one.
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
    /// Deadline for one attempt (send plus body read).
    pub timeout: Duration,
    /// Backoff multiplier for transport protocol failures.
    pub protocol_failure_factor: u32,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    ///
    /// Off by default so that consecutive delays never decrease.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Defaults for idempotent reads: three attempts, 1s base, 30s timeout.
    pub fn reads() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
            protocol_failure_factor: 2,
            jitter: false,
        }
    }

    /// Defaults for JSON writes: two attempts, 2s base, 60s timeout.
    pub fn writes() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(60),
            ..Self::reads()
        }
    }

    /// Defaults for multipart uploads: like writes with a 120s timeout.
    pub fn uploads() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            ..Self::writes()
        }
    }

    /// A single attempt and no backoff.
    pub fn no_retry(timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            timeout,
            ..Self::reads()
        }
    }

    /// Returns the delay to wait after the `failures`-th failed attempt, or
    /// `None` once the attempt cap is reached.
    ///
    /// The delay is `base_delay * 2^(failures - 1)`, capped at `max_delay`,
    /// and multiplied by `protocol_failure_factor` for protocol failures.
    pub fn delay_after(&self, failures: usize, protocol_failure: bool) -> Option<Duration> {
        if failures == 0 || failures >= self.max_attempts.max(1) {
            return None;
        }

        let exponent = u32::try_from(failures - 1).unwrap_or(u32::MAX);
        let multiplier = 2u32.saturating_pow(exponent);
        let mut delay = self.base_delay.saturating_mul(multiplier).min(self.max_delay);

        if protocol_failure {
            delay = delay.saturating_mul(self.protocol_failure_factor.max(1));
        }

        if self.jitter {
            let jitter_factor = rand::thread_rng().gen_range(0.5..=1.0);
            Some(delay.mul_f64(jitter_factor))
        } else {
            Some(delay)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::reads()
    }
}

/// The policy set of one client, one entry per request class.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicies {
    pub read: RetryPolicy,
    pub write: RetryPolicy,
    pub upload: RetryPolicy,
}

impl RetryPolicies {
    pub fn standard() -> Self {
        Self {
            read: RetryPolicy::reads(),
            write: RetryPolicy::writes(),
            upload: RetryPolicy::uploads(),
        }
    }

    pub fn for_class(&self, class: RequestClass) -> &RetryPolicy {
        match class {
            RequestClass::Read => &self.read,
            RequestClass::Write => &self.write,
            RequestClass::Upload => &self.upload,
        }
    }
}

/// Decides whether a failed attempt should be retried.
///
/// The attempt cap of the [`RetryPolicy`] always applies on top of the
/// predicate; a predicate can only narrow what gets retried.
///
/// # Examples
///
/// ```
/// use intake_client::{Error, RetryPredicate};
///
/// struct OnlyTimeouts;
///
/// impl RetryPredicate for OnlyTimeouts {
///     fn should_retry(&self, error: &Error, _failures: usize) -> bool {
///         matches!(error, Error::Timeout { .. })
///     }
/// }
/// ```
pub trait RetryPredicate: Send + Sync {
    /// `failures` is the number of failed attempts so far (1-indexed).
    fn should_retry(&self, error: &Error, failures: usize) -> bool;
}

/// Retry 5xx responses, network errors and timeouts.
///
/// This uses [`Error::is_retryable`] and is the default predicate.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnTransient;

impl RetryPredicate for RetryOnTransient {
    fn should_retry(&self, error: &Error, _failures: usize) -> bool {
        error.is_retryable()
    }
}

/// Retry only transport-level failures, never server responses.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnConnectionError;

impl RetryPredicate for RetryOnConnectionError {
    fn should_retry(&self, error: &Error, _failures: usize) -> bool {
        matches!(error, Error::Network { .. } | Error::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::reads()
        }
    }

    #[test]
    fn exponential_delays_until_cap() {
        let policy = policy(5);

        assert_eq!(policy.delay_after(1, false), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_after(2, false), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_after(3, false), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_after(4, false), Some(Duration::from_millis(800)));
        assert_eq!(policy.delay_after(5, false), None);
    }

    #[test]
    fn delays_never_decrease() {
        let policy = RetryPolicy {
            max_delay: Duration::from_millis(300),
            ..policy(10)
        };

        let delays: Vec<_> = (1..10).filter_map(|n| policy.delay_after(n, false)).collect();
        assert_eq!(delays.len(), 9);
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(delays.last(), Some(&Duration::from_millis(300)));
    }

    #[test]
    fn protocol_failures_back_off_longer() {
        let policy = policy(3);
        assert_eq!(policy.delay_after(1, true), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_after(2, true), Some(Duration::from_millis(400)));
    }

    #[test]
    fn single_attempt_never_waits() {
        assert_eq!(policy(1).delay_after(1, false), None);
        assert_eq!(policy(0).delay_after(1, false), None);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy(3)
        };
        for _ in 0..50 {
            let delay = policy.delay_after(2, false).unwrap();
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn standard_policies_scale_timeouts_by_class() {
        let policies = RetryPolicies::standard();
        let read = policies.for_class(RequestClass::Read);
        let write = policies.for_class(RequestClass::Write);
        let upload = policies.for_class(RequestClass::Upload);

        assert!(read.timeout < write.timeout);
        assert!(write.timeout < upload.timeout);
        assert!(write.max_attempts < read.max_attempts);
    }

    #[test]
    fn predicates() {
        let server = Error::api(Some(StatusCode::BAD_GATEWAY), "SERVER_ERROR", "down");
        let timeout = Error::Timeout {
            message: "deadline".into(),
        };

        assert!(RetryOnTransient.should_retry(&server, 1));
        assert!(RetryOnTransient.should_retry(&timeout, 1));
        assert!(!RetryOnConnectionError.should_retry(&server, 1));
        assert!(RetryOnConnectionError.should_retry(&timeout, 1));
    }
}
