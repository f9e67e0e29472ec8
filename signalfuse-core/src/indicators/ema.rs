//! Exponential Moving Average (EMA), streaming.
//!
//! Recursive: EMA[t] = alpha * x[t] + (1 - alpha) * EMA[t-1], alpha = 2 / (period + 1).
//! Seed: the SMA of the first `period` inputs.
//! Warm-up: `period` inputs; NaN before that.

#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    alpha: f64,
    seed_sum: f64,
    seen: usize,
    value: f64,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        assert!(period >= 1, "EMA period must be >= 1");
        Self {
            period,
            alpha: 2.0 / (period as f64 + 1.0),
            seed_sum: 0.0,
            seen: 0,
            value: f64::NAN,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Feed one value and return the current EMA (NaN during warm-up).
    pub fn update(&mut self, x: f64) -> f64 {
        if self.seen < self.period {
            self.seed_sum += x;
            self.seen += 1;
            if self.seen == self.period {
                self.value = self.seed_sum / self.period as f64;
            }
        } else {
            self.value = self.alpha * x + (1.0 - self.alpha) * self.value;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_ready(&self) -> bool {
        self.seen >= self.period
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.period);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{assert_approx, DEFAULT_EPSILON};

    #[test]
    fn ema_seed_is_sma() {
        let mut ema = Ema::new(3);
        assert!(ema.update(10.0).is_nan());
        assert!(ema.update(11.0).is_nan());
        assert_approx(ema.update(12.0), 11.0, DEFAULT_EPSILON);
        assert!(ema.is_ready());
    }

    #[test]
    fn ema_recursion() {
        let mut ema = Ema::new(3);
        for x in [10.0, 11.0, 12.0] {
            ema.update(x);
        }
        // alpha = 0.5: 0.5 * 13 + 0.5 * 11 = 12
        assert_approx(ema.update(13.0), 12.0, DEFAULT_EPSILON);
        // 0.5 * 14 + 0.5 * 12 = 13
        assert_approx(ema.update(14.0), 13.0, DEFAULT_EPSILON);
    }

    #[test]
    fn ema_period_one_tracks_input() {
        let mut ema = Ema::new(1);
        assert_approx(ema.update(5.0), 5.0, DEFAULT_EPSILON);
        assert_approx(ema.update(7.0), 7.0, DEFAULT_EPSILON);
    }

    #[test]
    fn reset_clears_state() {
        let mut ema = Ema::new(2);
        ema.update(1.0);
        ema.update(2.0);
        ema.reset();
        assert!(!ema.is_ready());
        assert!(ema.value().is_nan());
    }
}
