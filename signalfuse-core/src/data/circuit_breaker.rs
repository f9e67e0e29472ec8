//! Circuit breaker in front of a market data provider.
//!
//! An access denial (geo or IP block) opens the breaker at once. Transient
//! failures open it after `failure_threshold` in a row. While open, `check`
//! answers `CircuitOpen` without touching the network; the first check after
//! the cooldown closes it again.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

use super::provider::DataFetchError;

const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy)]
enum Gate {
    Closed { failures: u32 },
    Open { until: Instant },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    gate: Mutex<Gate>,
    cooldown: Duration,
    failure_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            gate: Mutex::new(Gate::Closed { failures: 0 }),
            cooldown,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Ok` if a request may go out now.
    pub fn check(&self) -> Result<(), DataFetchError> {
        let mut gate = self.gate();
        if let Gate::Open { until } = *gate {
            let now = Instant::now();
            if now < until {
                return Err(DataFetchError::CircuitOpen {
                    remaining_secs: (until - now).as_secs(),
                });
            }
            *gate = Gate::Closed { failures: 0 };
        }
        Ok(())
    }

    pub fn is_allowed(&self) -> bool {
        self.check().is_ok()
    }

    /// Feed a request outcome back into the breaker.
    pub fn observe<T>(&self, outcome: &Result<T, DataFetchError>) {
        let mut gate = self.gate();
        let failures = match (&*gate, outcome) {
            (_, Ok(_)) => {
                *gate = Gate::Closed { failures: 0 };
                return;
            }
            (Gate::Open { .. }, Err(_)) => return,
            (Gate::Closed { .. }, Err(e @ DataFetchError::AccessDenied { .. })) => {
                warn!(error = %e, cooldown_secs = self.cooldown.as_secs(), "access denied, circuit breaker open");
                *gate = self.opened();
                return;
            }
            (Gate::Closed { failures }, Err(e)) if e.is_transient() => failures + 1,
            (Gate::Closed { .. }, Err(_)) => return,
        };
        if failures >= self.failure_threshold {
            warn!(failures, cooldown_secs = self.cooldown.as_secs(), "repeated failures, circuit breaker open");
            *gate = self.opened();
        } else {
            *gate = Gate::Closed { failures };
        }
    }

    /// Open the breaker for a full cooldown regardless of history.
    pub fn trip(&self) {
        *self.gate() = self.opened();
    }

    fn opened(&self) -> Gate {
        Gate::Open {
            until: Instant::now() + self.cooldown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> Result<(), DataFetchError> {
        Err(DataFetchError::Network("reset".into()))
    }

    #[test]
    fn closed_breaker_lets_requests_through() {
        let cb = CircuitBreaker::new(Duration::from_secs(60));
        assert!(cb.check().is_ok());
    }

    #[test]
    fn opens_after_consecutive_transient_failures() {
        let cb = CircuitBreaker::new(Duration::from_secs(60));
        cb.observe(&network());
        cb.observe(&network());
        assert!(cb.is_allowed());
        cb.observe(&network());
        assert!(matches!(cb.check(), Err(DataFetchError::CircuitOpen { remaining_secs }) if remaining_secs > 0));
    }

    #[test]
    fn access_denial_opens_immediately() {
        let cb = CircuitBreaker::new(Duration::from_secs(60));
        cb.observe::<()>(&Err(DataFetchError::AccessDenied {
            status: 451,
            reason: "restricted location".into(),
        }));
        assert!(!cb.is_allowed());
    }

    #[test]
    fn success_clears_the_streak_and_bad_responses_do_not_count() {
        let cb = CircuitBreaker::new(Duration::from_secs(60)).with_failure_threshold(2);
        cb.observe(&network());
        cb.observe(&Ok(()));
        cb.observe(&network());
        cb.observe::<()>(&Err(DataFetchError::BadResponse("garbled".into())));
        assert!(cb.is_allowed());
    }

    #[test]
    fn closes_again_after_cooldown() {
        let cb = CircuitBreaker::new(Duration::from_millis(10));
        cb.trip();
        assert!(!cb.is_allowed());
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.is_allowed());
        cb.observe(&network());
        assert!(cb.is_allowed());
    }
}
