//! Retry policy with exponential backoff and jitter
//!
//! [`RetryPolicy`] decides whether a failed job runs again and when.
//! [`with_retry_if`] reuses the same backoff for short in-process retries of
//! store writes that hit a busy database.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::job::RetrySettings;

/// Maximum relative jitter applied to a delay
pub const JITTER_FRACTION: f64 = 0.25;

// ============================================================================
// Error Classes
// ============================================================================

/// Coarse class of a job failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Transient,
    Timeout,
    RateLimited,
    AuthFailure,
    InvalidTarget,
    PermissionDenied,
    Unknown,
}

impl ErrorClass {
    /// Classes that never succeed on a retry
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::AuthFailure | Self::InvalidTarget | Self::PermissionDenied
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate-limited",
            Self::AuthFailure => "auth-failure",
            Self::InvalidTarget => "invalid-target",
            Self::PermissionDenied => "permission-denied",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = std::convert::Infallible;

    /// Unknown labels map to [`ErrorClass::Unknown`]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "transient" | "network" => Self::Transient,
            "timeout" => Self::Timeout,
            "rate-limited" | "rate-limit" => Self::RateLimited,
            "auth-failure" | "auth" => Self::AuthFailure,
            "invalid-target" | "invalid-url" => Self::InvalidTarget,
            "permission-denied" | "forbidden" => Self::PermissionDenied,
            _ => Self::Unknown,
        })
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Backoff and retry decisions for one job
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    settings: RetrySettings,
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    /// Un-jittered delay before retry `attempt` (0-based)
    ///
    /// `min(initial * factor^attempt, max)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let s = &self.settings;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = s.initial_delay_secs * s.backoff_factor.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(s.max_delay_secs)
        } else {
            s.max_delay_secs
        };
        secs(capped)
    }

    /// Delay before retry `attempt`, jittered by up to ±25 % when enabled
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        self.calculate_delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn calculate_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if !self.settings.jitter {
            return base;
        }
        let unit: f64 = rng.gen_range(-1.0..=1.0);
        secs(base.as_secs_f64() * (1.0 + JITTER_FRACTION * unit))
    }

    /// Whether failure number `attempt` (0-based) of class `class` runs again
    pub fn should_retry(&self, attempt: u32, class: ErrorClass) -> bool {
        attempt < self.settings.max_retries && !class.is_permanent()
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetrySettings::default())
    }
}

// ============================================================================
// In-process Retry
// ============================================================================

/// Run `operation` until it succeeds, `should_retry` rejects the error, or
/// the policy runs out of attempts
pub async fn with_retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }
                if attempt >= policy.settings.max_retries {
                    warn!(attempt, error = %e, "Retries exhausted");
                    return Err(e);
                }

                let delay = policy.calculate_delay(attempt);
                warn!(
                    attempt,
                    max_retries = policy.settings.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, will retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::new(RetrySettings {
            jitter: false,
            ..Default::default()
        })
    }

    #[test]
    fn test_base_delay_growth_and_cap() {
        let policy = no_jitter();
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(8));
        assert_eq!(policy.base_delay(20), Duration::from_secs(300));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..12 {
            let base = policy.base_delay(attempt).as_secs_f64();
            for _ in 0..50 {
                let d = policy.calculate_delay(attempt).as_secs_f64();
                assert!(d >= base * 0.75 - 1e-9 && d <= base * 1.25 + 1e-9);
            }
        }
    }

    #[test]
    fn test_seeded_jitter_is_deterministic() {
        let policy = RetryPolicy::default();
        let a = policy.calculate_delay_with(2, &mut StdRng::seed_from_u64(7));
        let b = policy.calculate_delay_with(2, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0, ErrorClass::Transient));
        assert!(policy.should_retry(2, ErrorClass::Unknown));
        assert!(!policy.should_retry(3, ErrorClass::Transient));
        assert!(!policy.should_retry(0, ErrorClass::AuthFailure));
        assert!(!policy.should_retry(0, ErrorClass::InvalidTarget));
        assert!(!policy.should_retry(0, ErrorClass::PermissionDenied));
    }

    #[test]
    fn test_error_class_labels() {
        assert_eq!("auth_failure".parse::<ErrorClass>().unwrap(), ErrorClass::AuthFailure);
        assert_eq!("invalid_url".parse::<ErrorClass>().unwrap(), ErrorClass::InvalidTarget);
        assert_eq!("???".parse::<ErrorClass>().unwrap(), ErrorClass::Unknown);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let policy = RetryPolicy::new(RetrySettings {
            initial_delay_secs: 0.001,
            max_delay_secs: 0.01,
            ..Default::default()
        });
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let result: Result<u32, String> = with_retry_if(
            &policy,
            move || {
                let attempts = Arc::clone(&attempts_clone);
                async move {
                    let count = attempts.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err(String::from("busy"))
                    } else {
                        Ok(42)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_if_predicate_stops_immediately() {
        let policy = RetryPolicy::default();
        let result: Result<(), String> = with_retry_if(
            &policy,
            || async { Err(String::from("constraint violation")) },
            |e| !e.contains("constraint"),
        )
        .await;

        assert_eq!(result.unwrap_err(), "constraint violation");
    }
}
