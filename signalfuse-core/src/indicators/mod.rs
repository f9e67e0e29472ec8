//! Streaming indicator engine.
//!
//! One `IndicatorEngine` per (instrument, timeframe) stream. Each accepted candle
//! advances RSI, MACD (with its fast/slow EMAs) and Bollinger Bands by one step
//! and yields an `IndicatorSnapshot` that depends only on candles up to and
//! including that candle. Every field is NaN until the slowest indicator has
//! warmed up.

pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;

pub use bollinger::{Bollinger, BollingerValue};
pub use ema::Ema;
pub use macd::{Macd, MacdValue};
pub use rsi::{compute_rsi, Rsi};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::domain::{Candle, CandleRef, Timeframe};

/// A candle arrived older than the last one processed on its stream.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("out-of-order candle on {instrument} {timeframe}: {received} is older than last processed {last}")]
pub struct SequenceError {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub last: DateTime<Utc>,
    pub received: DateTime<Utc>,
}

/// Indicator periods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bollinger_period: usize,
    pub bollinger_std: f64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bollinger_period: 20,
            bollinger_std: 2.0,
        }
    }
}

impl IndicatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("indicators.rsi_period", self.rsi_period),
            ("indicators.macd_fast", self.macd_fast),
            ("indicators.macd_slow", self.macd_slow),
            ("indicators.macd_signal", self.macd_signal),
            ("indicators.bollinger_period", self.bollinger_period),
        ];
        for (field, value) in periods {
            if value == 0 {
                return Err(ConfigError::OutOfRange {
                    field,
                    value: 0.0,
                    expected: ">= 1",
                });
            }
        }
        if self.macd_fast >= self.macd_slow {
            return Err(ConfigError::OutOfRange {
                field: "indicators.macd_fast",
                value: self.macd_fast as f64,
                expected: "< indicators.macd_slow",
            });
        }
        if !self.bollinger_std.is_finite() || self.bollinger_std <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "indicators.bollinger_std",
                value: self.bollinger_std,
                expected: "> 0",
            });
        }
        Ok(())
    }

    /// Candles needed before every indicator is defined.
    pub fn warmup_candles(&self) -> usize {
        (self.rsi_period + 1)
            .max(self.macd_slow + self.macd_signal - 1)
            .max(self.bollinger_period)
    }
}

/// Indicator values as of one candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub candle_ref: CandleRef,
    pub close: f64,
    /// Close of the previous candle on the stream (NaN for the first candle).
    pub prev_close: f64,
    pub rsi: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_hist: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub bb_upper: f64,
    pub bb_mid: f64,
    pub bb_lower: f64,
}

impl IndicatorSnapshot {
    /// True once every indicator is defined.
    pub fn is_ready(&self) -> bool {
        [
            self.rsi,
            self.macd,
            self.macd_signal,
            self.macd_hist,
            self.ema_fast,
            self.ema_slow,
            self.bb_upper,
            self.bb_mid,
            self.bb_lower,
        ]
        .iter()
        .all(|v| v.is_finite())
    }

    /// Close position inside the band: -1 at the lower band, +1 at the upper, clamped.
    pub fn bollinger_position(&self) -> f64 {
        let half_width = (self.bb_upper - self.bb_lower) / 2.0;
        if half_width.is_nan() || half_width <= 0.0 {
            return 0.0;
        }
        ((self.close - self.bb_mid) / half_width).clamp(-1.0, 1.0)
    }

    /// Band width relative to the middle band.
    pub fn band_width(&self) -> f64 {
        if self.bb_mid.abs() < f64::EPSILON {
            return 0.0;
        }
        (self.bb_upper - self.bb_lower) / self.bb_mid
    }

    /// Close-to-close return of this candle (0 for the first candle).
    pub fn price_change(&self) -> f64 {
        if self.prev_close.is_nan() || self.prev_close <= 0.0 {
            return 0.0;
        }
        self.close / self.prev_close - 1.0
    }
}

/// Streaming RSI/MACD/EMA/Bollinger over one candle stream.
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    config: IndicatorConfig,
    rsi: Rsi,
    macd: Macd,
    bollinger: Bollinger,
    last: Option<IndicatorSnapshot>,
    accepted: usize,
}

impl IndicatorEngine {
    /// Build an engine. The config must already be validated.
    pub fn new(config: IndicatorConfig) -> Self {
        Self {
            rsi: Rsi::new(config.rsi_period),
            macd: Macd::new(config.macd_fast, config.macd_slow, config.macd_signal),
            bollinger: Bollinger::new(config.bollinger_period, config.bollinger_std),
            config,
            last: None,
            accepted: 0,
        }
    }

    pub fn config(&self) -> &IndicatorConfig {
        &self.config
    }

    pub fn warmup_candles(&self) -> usize {
        self.config.warmup_candles()
    }

    /// Candles accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn last_snapshot(&self) -> Option<&IndicatorSnapshot> {
        self.last.as_ref()
    }

    /// Advance by one candle.
    ///
    /// A candle with the same open_time as the last accepted one is ignored and the
    /// previous snapshot is returned. An older candle fails with `SequenceError` and
    /// leaves the engine untouched.
    pub fn update(&mut self, candle: &Candle) -> Result<IndicatorSnapshot, SequenceError> {
        if let Some(last) = &self.last {
            let last_time = last.candle_ref.open_time;
            if candle.open_time < last_time {
                return Err(SequenceError {
                    instrument: candle.instrument.clone(),
                    timeframe: candle.timeframe,
                    last: last_time,
                    received: candle.open_time,
                });
            }
            if candle.open_time == last_time {
                return Ok(last.clone());
            }
        }

        let prev_close = self.last.as_ref().map_or(f64::NAN, |s| s.close);
        let rsi = self.rsi.update(candle.close);
        let macd = self.macd.update(candle.close);
        let bands = self.bollinger.update(candle.close);

        let snapshot = IndicatorSnapshot {
            candle_ref: candle.candle_ref(),
            close: candle.close,
            prev_close,
            rsi,
            macd: macd.macd,
            macd_signal: macd.signal,
            macd_hist: macd.histogram,
            ema_fast: macd.ema_fast,
            ema_slow: macd.ema_slow,
            bb_upper: bands.upper,
            bb_mid: bands.middle,
            bb_lower: bands.lower,
        };

        self.accepted += 1;
        self.last = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Drop all state, as if no candle had been seen.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }
}

/// Create candles from close prices for testing.
///
/// open = previous close (or close for the first candle), high/low = body ± 0.1%,
/// one base-timeframe step apart starting 2024-01-01T00:00Z.
#[cfg(test)]
pub fn make_candles(closes: &[f64]) -> Vec<Candle> {
    use chrono::TimeZone;
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { closes[i - 1] };
            Candle {
                instrument: "TEST".to_string(),
                timeframe: Timeframe::M5,
                open_time: start + Timeframe::M5.duration() * i as i32,
                open,
                high: open.max(close) * 1.001,
                low: open.min(close) * 0.999,
                close,
                volume: 1000.0,
            }
        })
        .collect()
}

/// Assert two f64 values are approximately equal (within epsilon).
#[cfg(test)]
pub fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
    assert!(
        (actual - expected).abs() < epsilon,
        "assert_approx failed: actual={actual}, expected={expected}, diff={}, epsilon={epsilon}",
        (actual - expected).abs()
    );
}

/// Default epsilon for indicator tests.
#[cfg(test)]
pub const DEFAULT_EPSILON: f64 = 1e-10;
