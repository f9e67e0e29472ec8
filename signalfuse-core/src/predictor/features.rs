//! Versioned feature vector fed to direction models.
//!
//! Features are a fixed ordered numeric vector. The name → index mapping is owned
//! by the schema version; a model trained against another version is rejected
//! when it is loaded, never at inference time.
//!
//! Schema v1, all scale-free:
//!
//! | idx | name            | definition                              |
//! |-----|-----------------|-----------------------------------------|
//! | 0   | `rsi`           | RSI / 100                               |
//! | 1   | `macd`          | MACD line / close                       |
//! | 2   | `macd_hist`     | MACD histogram / close                  |
//! | 3   | `ema_diff`      | ema_fast / ema_slow - 1                 |
//! | 4   | `bollinger_pos` | close position in the band, [-1, 1]     |
//! | 5   | `volatility`    | band width / middle band                |
//! | 6   | `price_change`  | close-to-close return                   |

use serde::{Deserialize, Serialize};

use crate::indicators::IndicatorSnapshot;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const FEATURE_NAMES: [&str; 7] = [
    "rsi",
    "macd",
    "macd_hist",
    "ema_diff",
    "bollinger_pos",
    "volatility",
    "price_change",
];

/// Name → index mapping for one schema version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub names: Vec<String>,
}

impl FeatureSchema {
    pub fn current() -> Self {
        Self {
            version: FEATURE_SCHEMA_VERSION,
            names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// Features for one candle, tagged with the schema version that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub schema_version: u32,
    pub values: Vec<f64>,
}

impl FeatureVector {
    /// Build schema-v1 features. `None` while any indicator is still warming up.
    pub fn from_snapshot(snapshot: &IndicatorSnapshot) -> Option<Self> {
        if !snapshot.is_ready() || snapshot.close <= 0.0 || snapshot.ema_slow <= 0.0 {
            return None;
        }
        let close = snapshot.close;
        let values = vec![
            snapshot.rsi / 100.0,
            snapshot.macd / close,
            snapshot.macd_hist / close,
            snapshot.ema_fast / snapshot.ema_slow - 1.0,
            snapshot.bollinger_position(),
            snapshot.band_width(),
            snapshot.price_change(),
        ];
        Some(Self {
            schema_version: FEATURE_SCHEMA_VERSION,
            values,
        })
    }

    pub fn get(&self, schema: &FeatureSchema, name: &str) -> Option<f64> {
        schema.index_of(name).and_then(|i| self.values.get(i).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{make_candles, IndicatorConfig, IndicatorEngine};

    fn warm_snapshot() -> IndicatorSnapshot {
        let cfg = IndicatorConfig {
            rsi_period: 3,
            macd_fast: 2,
            macd_slow: 4,
            macd_signal: 2,
            bollinger_period: 3,
            bollinger_std: 2.0,
        };
        let mut engine = IndicatorEngine::new(cfg);
        let mut last = None;
        for c in make_candles(&[100.0, 101.0, 100.5, 102.0, 103.0, 102.5, 104.0]) {
            last = Some(engine.update(&c).unwrap());
        }
        last.unwrap()
    }

    #[test]
    fn schema_v1_layout() {
        let schema = FeatureSchema::current();
        assert_eq!(schema.version, 1);
        assert_eq!(schema.len(), 7);
        assert_eq!(schema.index_of("rsi"), Some(0));
        assert_eq!(schema.index_of("price_change"), Some(6));
        assert_eq!(schema.index_of("volume"), None);
    }

    #[test]
    fn features_follow_schema_order() {
        let snap = warm_snapshot();
        let fv = FeatureVector::from_snapshot(&snap).unwrap();
        let schema = FeatureSchema::current();
        assert_eq!(fv.values.len(), schema.len());
        assert_eq!(fv.schema_version, FEATURE_SCHEMA_VERSION);
        assert!((fv.get(&schema, "rsi").unwrap() - snap.rsi / 100.0).abs() < 1e-12);
        assert!(
            (fv.get(&schema, "price_change").unwrap() - (104.0 / 102.5 - 1.0)).abs() < 1e-12
        );
        assert!(fv.values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn no_features_during_warmup() {
        let mut engine = IndicatorEngine::new(IndicatorConfig::default());
        let snap = engine.update(&make_candles(&[100.0])[0]).unwrap();
        assert!(FeatureVector::from_snapshot(&snap).is_none());
    }
}
