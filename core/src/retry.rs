//! Retry policy: classifies errors as retryable and computes backoff with jitter.
//!
//! See SPEC_FULL.md §4.3. Shape (FailureType/RetryDecision/classify_error) is grounded on
//! the teacher's `download/retry.rs`; the jitter formula differs deliberately (see
//! DESIGN.md): the teacher adds a flat `0..=500ms`, this crate multiplies by a uniform
//! factor in `[0.75, 1.25]` per the spec.

use std::time::Duration;

use rand::Rng;

use crate::error::{DownloadError, ErrorTag};

/// How a failure should be handled by [`with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    Transient,
    Permanent,
    RateLimited,
}

/// Outcome of a single retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration, attempt: u32 },
    DoNotRetry { reason: String },
}

/// Backoff configuration. Defaults per SPEC_FULL.md §4.3: 5 / 1000ms / 30000ms / 2.0 / on.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// `min(initialDelay * backoffFactor^n, maxDelay)`, then multiplied by a uniform
    /// `[0.75, 1.25]` factor when jitter is on, then floored (whole milliseconds).
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);

        let final_ms = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            (capped_ms * factor).floor()
        } else {
            capped_ms.floor()
        };

        Duration::from_millis(final_ms.max(0.0) as u64)
    }

    /// Decides whether `attempt` (0-indexed, the attempt that just failed) should retry,
    /// honoring a `Retry-After` override when present on a retryable response.
    #[must_use]
    pub fn should_retry(
        &self,
        attempt: u32,
        failure: FailureType,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if failure == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "non-retryable error".to_string(),
            };
        }
        if attempt + 1 >= self.max_retries {
            return RetryDecision::DoNotRetry {
                reason: format!("exhausted {} retries", self.max_retries),
            };
        }
        let delay = retry_after.unwrap_or_else(|| self.calculate_delay(attempt));
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }
}

/// Classifies an HTTP status code per SPEC_FULL.md §4.3: 408/429/5xx retryable, other 4xx not.
#[must_use]
pub fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        500..=599 => FailureType::Transient,
        400..=499 => FailureType::Permanent,
        _ => FailureType::Transient,
    }
}

/// Classifies a [`DownloadError`] into a [`FailureType`] for the retry loop.
#[must_use]
pub fn classify_error(err: &DownloadError) -> FailureType {
    match err.tag() {
        ErrorTag::NetworkTransient | ErrorTag::StallTimeout | ErrorTag::HttpServerStatus => {
            FailureType::Transient
        }
        ErrorTag::HttpClientStatus => {
            if let DownloadError::HttpClientStatus { status, .. } = err {
                classify_http_status(*status)
            } else {
                FailureType::Permanent
            }
        }
        ErrorTag::HttpRangeNotSupported => FailureType::Transient,
        ErrorTag::DiskFull
        | ErrorTag::Permission
        | ErrorTag::FsIo
        | ErrorTag::SizeMismatch
        | ErrorTag::ChecksumMismatch
        | ErrorTag::Cancelled
        | ErrorTag::NotFound
        | ErrorTag::Internal => FailureType::Permanent,
    }
}

/// Parses a `Retry-After` header value: integer seconds or an HTTP-date, capped at 1 hour.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }
    let when = httpdate::parse_http_date(value.trim()).ok()?;
    let delay = when.duration_since(std::time::SystemTime::now()).ok()?;
    Some(delay.min(MAX_RETRY_AFTER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_http_status_retryable() {
        assert_eq!(classify_http_status(408), FailureType::Transient);
        assert_eq!(classify_http_status(429), FailureType::RateLimited);
        assert_eq!(classify_http_status(500), FailureType::Transient);
        assert_eq!(classify_http_status(503), FailureType::Transient);
    }

    #[test]
    fn test_classify_http_status_non_retryable() {
        assert_eq!(classify_http_status(404), FailureType::Permanent);
        assert_eq!(classify_http_status(403), FailureType::Permanent);
    }

    #[test]
    fn test_calculate_delay_respects_max_delay_cap() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        // backoff_factor^n grows past max_delay quickly; with jitter off the cap is exact.
        let delay = policy.calculate_delay(10);
        assert_eq!(delay, policy.max_delay);
    }

    #[test]
    fn test_calculate_delay_jitter_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..5 {
            let delay = policy.calculate_delay(attempt);
            let base = (policy.initial_delay.as_millis() as f64
                * policy.backoff_factor.powi(attempt as i32))
            .min(policy.max_delay.as_millis() as f64);
            let lower = (base * 0.75).floor() as u64;
            let upper = (base * 1.25).floor() as u64;
            let got = delay.as_millis() as u64;
            assert!(
                got >= lower && got <= upper,
                "attempt {attempt}: {got} not within [{lower}, {upper}]"
            );
        }
    }

    #[test]
    fn test_should_retry_permanent_never_retries() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(0, FailureType::Permanent, None);
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));
    }

    #[test]
    fn test_should_retry_exhausted_after_max_retries() {
        let policy = RetryPolicy::with_max_retries(3);
        let decision = policy.should_retry(2, FailureType::Transient, None);
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));
    }

    #[test]
    fn test_should_retry_honors_retry_after_override() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(0, FailureType::RateLimited, Some(Duration::from_secs(2)));
        match decision {
            RetryDecision::Retry { delay, attempt } => {
                assert_eq!(delay, Duration::from_secs(2));
                assert_eq!(attempt, 1);
            }
            RetryDecision::DoNotRetry { .. } => panic!("expected retry"),
        }
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_parse_retry_after_caps_excessive_values() {
        assert_eq!(parse_retry_after("999999"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_retry_after_invalid_returns_none() {
        assert_eq!(parse_retry_after("not-a-date"), None);
    }

    #[test]
    fn test_classify_error_tags() {
        let err = DownloadError::StallTimeout {
            url: "https://x".into(),
            idle_secs: 45,
        };
        assert_eq!(classify_error(&err), FailureType::Transient);

        let cancelled = DownloadError::Cancelled;
        assert_eq!(classify_error(&cancelled), FailureType::Permanent);
    }
}
