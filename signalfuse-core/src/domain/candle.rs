//! Candles and the timeframe grid they live on.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed candle interval.
///
/// Serialized in exchange notation (`"5m"`, `"1h"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// Interval length in milliseconds.
    pub fn millis(&self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            Timeframe::M1 => MINUTE,
            Timeframe::M5 => 5 * MINUTE,
            Timeframe::M15 => 15 * MINUTE,
            Timeframe::M30 => 30 * MINUTE,
            Timeframe::H1 => 60 * MINUTE,
            Timeframe::H4 => 240 * MINUTE,
            Timeframe::D1 => 1_440 * MINUTE,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::milliseconds(self.millis())
    }

    /// Number of intervals in a 365-day year (used to annualize per-candle statistics).
    pub fn periods_per_year(&self) -> f64 {
        365.0 * 86_400_000.0 / self.millis() as f64
    }

    /// True if `self` is a strict integer multiple of `base`.
    pub fn is_multiple_of(&self, base: Timeframe) -> bool {
        self.millis() > base.millis() && self.millis() % base.millis() == 0
    }

    /// Start of the epoch-aligned window containing `t`.
    pub fn window_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let ms = t.timestamp_millis();
        let start = ms - ms.rem_euclid(self.millis());
        Utc.timestamp_millis_opt(start).single().unwrap_or(t)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .iter()
            .copied()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| format!("unknown timeframe '{s}' (expected one of 1m, 5m, 15m, 30m, 1h, 4h, 1d)"))
    }
}

/// OHLCV candle for one instrument on one timeframe.
///
/// Immutable once received. Uniquely identified by (instrument, timeframe, open_time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// First instant after the candle's interval.
    pub fn close_time(&self) -> DateTime<Utc> {
        self.open_time + self.timeframe.duration()
    }

    pub fn candle_ref(&self) -> CandleRef {
        CandleRef {
            instrument: self.instrument.clone(),
            timeframe: self.timeframe,
            open_time: self.open_time,
        }
    }

    /// Basic OHLCV sanity: finite positive prices, high bounds the body, low bounds it from below.
    pub fn is_sane(&self) -> bool {
        let finite = [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite());
        finite
            && self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.low > 0.0
            && self.volume >= 0.0
    }
}

/// Identity of the candle a derived record was computed from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CandleRef {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
}

impl fmt::Display for CandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}[{}]",
            self.instrument,
            self.timeframe,
            self.open_time.to_rfc3339()
        )
    }
}
