//! Bounded fetches: a hard timeout per call and exponential backoff across calls.

use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::time::Duration;
use tracing::warn;

use super::provider::DataFetchError;
use crate::config::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Hard limit on a single attempt.
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                field: "retry.max_attempts",
                value: 0.0,
                expected: ">= 1",
            });
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::OutOfRange {
                field: "retry.timeout_ms",
                value: 0.0,
                expected: ">= 1",
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before `attempt` (1-based): `base * 2^(attempt - 2)`, zero before the first.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(attempt - 2);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Run `f` on a worker thread and give up after `timeout`.
///
/// On timeout the worker is detached; its result is dropped when it finishes.
/// Each call spawns one thread, so a source that can block forever leaks one
/// thread per call: sources must bound their own I/O (`BinanceSource` sets the
/// same timeout on its HTTP client).
pub fn with_timeout<T, F>(timeout: Duration, f: F) -> Result<T, DataFetchError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DataFetchError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("fetch".into())
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| DataFetchError::Network(format!("failed to spawn fetch worker: {e}")))?;
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(DataFetchError::Timeout {
            after_ms: timeout.as_millis() as u64,
        }),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(DataFetchError::Network("fetch worker exited without a result".into()))
        }
    }
}

/// Retry transient failures with exponential backoff, up to `policy.max_attempts`.
///
/// Permanent failures return immediately. A rate limit waits at least the
/// provider's retry-after, still capped at `max_delay_ms`.
pub fn retry_transient<T, F>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, DataFetchError>
where
    F: FnMut(u32) -> Result<T, DataFetchError>,
{
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts.max(1) {
        let mut delay = policy.delay_before(attempt);
        if let Some(DataFetchError::RateLimited { retry_after_secs }) = &last_error {
            delay = delay
                .max(Duration::from_secs(*retry_after_secs))
                .min(Duration::from_millis(policy.max_delay_ms));
        }
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() => {
                warn!(
                    source = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "transient fetch failure"
                );
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or_else(|| DataFetchError::Network("no attempt made".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            timeout_ms: 50,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 350,
            ..RetryPolicy::default()
        };
        assert_eq!(p.delay_before(1), Duration::ZERO);
        assert_eq!(p.delay_before(2), Duration::from_millis(100));
        assert_eq!(p.delay_before(3), Duration::from_millis(200));
        assert_eq!(p.delay_before(4), Duration::from_millis(350));
    }

    #[test]
    fn transient_failures_are_retried() {
        let calls = Cell::new(0);
        let out = retry_transient(&fast(), "test", |_| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(DataFetchError::Server { status: 503 })
            } else {
                Ok(42)
            }
        });
        assert_eq!(out, Ok(42));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn attempts_are_bounded() {
        let calls = Cell::new(0);
        let out: Result<(), _> = retry_transient(&fast(), "test", |_| {
            calls.set(calls.get() + 1);
            Err(DataFetchError::Network("down".into()))
        });
        assert_eq!(out, Err(DataFetchError::Network("down".into())));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let calls = Cell::new(0);
        let out: Result<(), _> = retry_transient(&fast(), "test", |_| {
            calls.set(calls.get() + 1);
            Err(DataFetchError::AccessDenied {
                status: 451,
                reason: "restricted location".into(),
            })
        });
        assert!(matches!(out, Err(DataFetchError::AccessDenied { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn slow_call_times_out() {
        let out: Result<u32, _> = with_timeout(Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(300));
            Ok(1)
        });
        assert_eq!(out, Err(DataFetchError::Timeout { after_ms: 20 }));
    }

    #[test]
    fn timed_out_worker_finishes_in_background() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let out: Result<u32, _> = with_timeout(Duration::from_millis(10), move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
            Ok(1)
        });
        assert_eq!(out, Err(DataFetchError::Timeout { after_ms: 10 }));
        assert!(!done.load(Ordering::SeqCst));
        std::thread::sleep(Duration::from_millis(200));
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn fast_call_returns_its_result() {
        let out = with_timeout(Duration::from_millis(500), || Ok::<_, DataFetchError>(7));
        assert_eq!(out, Ok(7));
    }
}
