//! Moving Average Convergence/Divergence (MACD), streaming.
//!
//! macd = EMA(fast) - EMA(slow); signal = EMA(signal_period) of the macd line;
//! histogram = macd - signal.
//! The signal EMA only sees finite macd values, so the warm-up is
//! `slow + signal - 1` closes.

use super::ema::Ema;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdValue {
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

impl MacdValue {
    fn undefined(ema_fast: f64, ema_slow: f64) -> Self {
        Self {
            ema_fast,
            ema_slow,
            macd: f64::NAN,
            signal: f64::NAN,
            histogram: f64::NAN,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        assert!(fast < slow, "MACD fast period must be < slow period");
        Self {
            fast: Ema::new(fast),
            slow: Ema::new(slow),
            signal: Ema::new(signal),
        }
    }

    pub fn update(&mut self, close: f64) -> MacdValue {
        let fast = self.fast.update(close);
        let slow = self.slow.update(close);
        if !slow.is_finite() {
            return MacdValue::undefined(fast, slow);
        }

        let macd = fast - slow;
        let signal = self.signal.update(macd);
        if !signal.is_finite() {
            return MacdValue {
                macd,
                ..MacdValue::undefined(fast, slow)
            };
        }

        MacdValue {
            ema_fast: fast,
            ema_slow: slow,
            macd,
            signal,
            histogram: macd - signal,
        }
    }

    pub fn warmup(&self) -> usize {
        self.slow.period() + self.signal.period() - 1
    }
}
