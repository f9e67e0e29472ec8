//! Bollinger Bands, streaming.
//!
//! - Middle: SMA(close, period)
//! - Upper: middle + mult * stddev(close, period)
//! - Lower: middle - mult * stddev(close, period)
//!
//! Uses population stddev (divide by N).
//! Warm-up: `period` closes.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerValue {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

#[derive(Debug, Clone)]
pub struct Bollinger {
    period: usize,
    multiplier: f64,
    window: VecDeque<f64>,
}

impl Bollinger {
    pub fn new(period: usize, multiplier: f64) -> Self {
        assert!(period >= 1, "Bollinger period must be >= 1");
        Self {
            period,
            multiplier,
            window: VecDeque::with_capacity(period),
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn update(&mut self, close: f64) -> BollingerValue {
        if self.window.len() == self.period {
            self.window.pop_front();
        }
        self.window.push_back(close);

        if self.window.len() < self.period {
            return BollingerValue {
                upper: f64::NAN,
                middle: f64::NAN,
                lower: f64::NAN,
            };
        }

        let n = self.period as f64;
        let mean = self.window.iter().sum::<f64>() / n;
        let variance = self.window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let band = self.multiplier * variance.sqrt();

        BollingerValue {
            upper: mean + band,
            middle: mean,
            lower: mean - band,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{assert_approx, DEFAULT_EPSILON};

    #[test]
    fn bands_collapse_on_flat_series() {
        let mut bb = Bollinger::new(3, 2.0);
        bb.update(10.0);
        bb.update(10.0);
        let v = bb.update(10.0);
        assert_approx(v.upper, 10.0, DEFAULT_EPSILON);
        assert_approx(v.lower, 10.0, DEFAULT_EPSILON);
    }

    #[test]
    fn population_stddev() {
        // Window [2, 4, 4, 4, 5, 5, 7, 9]: mean 5, population std 2.
        let mut bb = Bollinger::new(8, 2.0);
        let mut v = None;
        for x in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            v = Some(bb.update(x));
        }
        let v = v.unwrap();
        assert_approx(v.middle, 5.0, DEFAULT_EPSILON);
        assert_approx(v.upper, 9.0, DEFAULT_EPSILON);
        assert_approx(v.lower, 1.0, DEFAULT_EPSILON);
    }

    #[test]
    fn window_rolls() {
        let mut bb = Bollinger::new(2, 1.0);
        bb.update(1.0);
        bb.update(3.0);
        let v = bb.update(5.0);
        assert_approx(v.middle, 4.0, DEFAULT_EPSILON);
    }

    #[test]
    fn nan_during_warmup() {
        let mut bb = Bollinger::new(3, 2.0);
        assert!(bb.update(1.0).middle.is_nan());
        assert!(bb.update(2.0).upper.is_nan());
    }
}
