//! Relative Strength Index (RSI), streaming.
//!
//! Uses Wilder smoothing of average gains and average losses.
//! RSI = 100 - 100 / (1 + avg_gain / avg_loss)
//! Seed: the plain mean of the first `period` close-to-close changes.
//! Warm-up: `period + 1` closes.
//! Edge cases: avg_loss == 0 → RSI = 100; avg_gain == 0 → RSI = 0; both → 50.

#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    prev_close: Option<f64>,
    changes_seen: usize,
    avg_gain: f64,
    avg_loss: f64,
    value: f64,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        assert!(period >= 1, "RSI period must be >= 1");
        Self {
            period,
            prev_close: None,
            changes_seen: 0,
            avg_gain: 0.0,
            avg_loss: 0.0,
            value: f64::NAN,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Feed one close and return the current RSI (NaN during warm-up).
    pub fn update(&mut self, close: f64) -> f64 {
        let Some(prev) = self.prev_close.replace(close) else {
            return self.value;
        };

        let change = close - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        let p = self.period as f64;

        if self.changes_seen < self.period {
            self.avg_gain += gain;
            self.avg_loss += loss;
            self.changes_seen += 1;
            if self.changes_seen < self.period {
                return self.value;
            }
            self.avg_gain /= p;
            self.avg_loss /= p;
        } else {
            self.avg_gain = (self.avg_gain * (p - 1.0) + gain) / p;
            self.avg_loss = (self.avg_loss * (p - 1.0) + loss) / p;
        }

        self.value = compute_rsi(self.avg_gain, self.avg_loss);
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_ready(&self) -> bool {
        self.changes_seen >= self.period
    }
}

pub fn compute_rsi(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_gain == 0.0 && avg_loss == 0.0 {
        return 50.0;
    }
    if avg_loss == 0.0 {
        return 100.0;
    }
    if avg_gain == 0.0 {
        return 0.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}
