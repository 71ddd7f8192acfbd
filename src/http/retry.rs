//! Retry policy and failure classification for workflow invocations.

use reqwest::StatusCode;
use std::time::Duration;

use super::client::TransportError;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default delay the backoff curve starts from.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(10);

/// Default upper bound for a single backoff delay (before jitter).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(600);

/// Default jitter, as a fraction of the computed delay.
pub const DEFAULT_JITTER: f64 = 0.1;

/// Why an attempt failed in a way that is worth trying again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The attempt exceeded its deadline
    Timeout,
    /// The upstream gateway answered with HTTP 504
    GatewayTimeout,
    /// Network error, malformed body or a missing required field
    Transient(String),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "request timed out"),
            FailureKind::GatewayTimeout => write!(f, "gateway timeout (HTTP 504)"),
            FailureKind::Transient(msg) => write!(f, "transient error: {}", msg),
        }
    }
}

/// How the controller should treat a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx, go on and decode the body
    Success,
    /// 504, retry with the timeout curve
    GatewayTimeout,
    /// Any other 4xx/5xx, give up immediately
    Fatal,
    /// Informational or redirect status that reqwest did not resolve
    Unexpected,
}

/// Classifies an HTTP status.
///
/// 504 is checked before the generic error rule: it is the one server error
/// that is retried.
pub fn classify_status(status: StatusCode) -> StatusClass {
    if status == StatusCode::GATEWAY_TIMEOUT {
        return StatusClass::GatewayTimeout;
    }

    if status.is_client_error() || status.is_server_error() {
        StatusClass::Fatal
    } else if status.is_success() {
        StatusClass::Success
    } else {
        StatusClass::Unexpected
    }
}

/// Maps a transport error onto the retry taxonomy.
/// Returns `None` when retrying cannot help (the client was closed).
pub fn classify_transport(error: &TransportError) -> Option<FailureKind> {
    match error {
        TransportError::Timeout(_) => Some(FailureKind::Timeout),
        TransportError::Network(msg) => Some(FailureKind::Transient(msg.clone())),
        TransportError::Closed => None,
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added as uniform random jitter, in `0.0..=1.0`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: DEFAULT_JITTER,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            DEFAULT_JITTER
        };
        self
    }

    /// Delay before jitter for the retry that follows `failures` failed attempts.
    ///
    /// Timeouts (including 504) back off from `base * 2^failures`; other
    /// transient errors start one step lower, at `base * 2^(failures - 1)`.
    pub fn base_backoff(&self, kind: &FailureKind, failures: u32) -> Duration {
        let exponent = match kind {
            FailureKind::Timeout | FailureKind::GatewayTimeout => failures,
            FailureKind::Transient(_) => failures.saturating_sub(1),
        };
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Full delay including jitter. `sample` is a uniform draw from `[0, 1]`.
    pub fn backoff_delay(&self, kind: &FailureKind, failures: u32, sample: f64) -> Duration {
        let delay = self.base_backoff(kind, failures);
        let sample = if sample.is_finite() {
            sample.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let jitter = Duration::try_from_secs_f64(delay.as_secs_f64() * self.jitter * sample)
            .unwrap_or(Duration::ZERO);
        delay.saturating_add(jitter)
    }

    /// Total number of attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(600))
    }

    #[test]
    fn test_failure_kind_display() {
        assert!(FailureKind::Timeout.to_string().contains("timed out"));
        assert!(FailureKind::GatewayTimeout.to_string().contains("504"));
        let err = FailureKind::Transient("connection reset".to_string());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_classify_status_gateway_timeout_before_generic_error() {
        assert_eq!(
            classify_status(StatusCode::GATEWAY_TIMEOUT),
            StatusClass::GatewayTimeout
        );
    }

    #[test]
    fn test_classify_status_errors_are_fatal() {
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::NOT_FOUND,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert_eq!(classify_status(status), StatusClass::Fatal, "{}", status);
        }
    }

    #[test]
    fn test_classify_status_success_and_unexpected() {
        assert_eq!(classify_status(StatusCode::OK), StatusClass::Success);
        assert_eq!(classify_status(StatusCode::ACCEPTED), StatusClass::Success);
        assert_eq!(
            classify_status(StatusCode::NOT_MODIFIED),
            StatusClass::Unexpected
        );
    }

    #[test]
    fn test_classify_transport() {
        assert_eq!(
            classify_transport(&TransportError::Timeout("deadline".to_string())),
            Some(FailureKind::Timeout)
        );
        assert_eq!(
            classify_transport(&TransportError::Network("refused".to_string())),
            Some(FailureKind::Transient("refused".to_string()))
        );
        assert_eq!(classify_transport(&TransportError::Closed), None);
    }

    #[test]
    fn test_timeout_delay_within_documented_bounds() {
        let policy = policy();
        for n in 1..=policy.max_retries {
            let floor = policy.base_delay * 2u32.pow(n);
            for sample in [0.0, 0.5, 1.0] {
                let delay = policy.backoff_delay(&FailureKind::Timeout, n, sample);
                assert!(delay >= floor, "n={} delay={:?}", n, delay);
                assert!(delay <= floor.mul_f64(1.1), "n={} delay={:?}", n, delay);
                assert!(delay <= policy.max_delay.mul_f64(1.1));
            }
        }
    }

    #[test]
    fn test_gateway_timeout_uses_timeout_curve() {
        let policy = policy();
        for n in 1..=policy.max_retries {
            assert_eq!(
                policy.base_backoff(&FailureKind::GatewayTimeout, n),
                policy.base_backoff(&FailureKind::Timeout, n)
            );
        }
    }

    #[test]
    fn test_transient_curve_starts_at_base_delay() {
        let policy = policy();
        let kind = FailureKind::Transient("reset".to_string());
        assert_eq!(policy.base_backoff(&kind, 1), Duration::from_secs(1));
        assert_eq!(policy.base_backoff(&kind, 2), Duration::from_secs(2));
        assert_eq!(policy.base_backoff(&kind, 3), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_is_capped_and_non_decreasing() {
        let policy = RetryPolicy::new(40, Duration::from_secs(10), Duration::from_secs(600));
        let mut previous = Duration::ZERO;
        for n in 1..=40 {
            let delay = policy.base_backoff(&FailureKind::Timeout, n);
            assert!(delay >= previous);
            assert!(delay <= policy.max_delay);
            let jittered = policy.backoff_delay(&FailureKind::Timeout, n, 1.0);
            assert!(jittered <= policy.max_delay.mul_f64(1.1));
            previous = delay;
        }
        assert_eq!(previous, policy.max_delay);
    }

    #[test]
    fn test_jitter_is_clamped() {
        let policy = policy().with_jitter(5.0);
        assert_eq!(policy.jitter, 1.0);
        let policy = policy.with_jitter(-1.0);
        assert_eq!(policy.jitter, 0.0);
        let policy = policy.with_jitter(f64::NAN);
        assert_eq!(policy.jitter, DEFAULT_JITTER);
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(10));
        assert_eq!(policy.max_delay, Duration::from_secs(600));
        assert_eq!(policy.max_attempts(), 6);
    }
}
