//! Engine configuration: indicators, fusion weights, risk limits, timeframes.
//!
//! Every section carries serde defaults, so a TOML file only needs the keys it
//! overrides. `EngineConfig::validate` runs once at startup; every error it
//! reports is fatal.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::aggregator::TimeframeConfig;
use crate::fusion::FusionConfig;
use crate::indicators::IndicatorConfig;
use crate::risk::RiskConfig;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("fusion weights must be in [0, 1] and sum to 1 (w_indicator={w_indicator}, w_ml={w_ml})")]
    InvalidWeights { w_indicator: f64, w_ml: f64 },

    #[error("{field} out of range: {value} (expected {expected})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error("invalid timeframes: {0}")]
    InvalidTimeframes(String),

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("config I/O error: {0}")]
    Io(String),
}

/// Everything the decision pipeline needs for one instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub indicators: IndicatorConfig,
    pub fusion: FusionConfig,
    pub risk: RiskConfig,
    pub timeframes: TimeframeConfig,
}

impl EngineConfig {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.indicators.validate()?;
        self.fusion.validate()?;
        self.risk.validate()?;
        self.timeframes.validate()?;
        Ok(())
    }

    /// The same configuration with the predictor switched off (`w_ml = 0`).
    pub fn without_ml(&self) -> Self {
        Self {
            fusion: self.fusion.indicator_only(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Timeframe;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = EngineConfig::from_toml(
            r#"
[indicators]
rsi_period = 7

[fusion]
w_indicator = 0.7
w_ml = 0.3

[timeframes]
base = "15m"
higher = ["1h", "4h"]
"#,
        )
        .unwrap();
        assert_eq!(cfg.indicators.rsi_period, 7);
        assert_eq!(cfg.indicators.macd_slow, 26);
        assert_eq!(cfg.fusion.w_ml, 0.3);
        assert_eq!(cfg.fusion.open_threshold, 0.6);
        assert_eq!(cfg.risk.max_fraction, 0.25);
        assert_eq!(cfg.timeframes.base, Timeframe::M15);
        assert_eq!(cfg.timeframes.higher, vec![Timeframe::H1, Timeframe::H4]);
    }

    #[test]
    fn weights_not_summing_to_one_fail() {
        let err = EngineConfig::from_toml("[fusion]\nw_indicator = 0.7\nw_ml = 0.7\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidWeights { .. }));
    }

    #[test]
    fn unparsable_toml_fails() {
        assert!(matches!(
            EngineConfig::from_toml("[fusion\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn without_ml_zeroes_the_model_weight() {
        let cfg = EngineConfig::default().without_ml();
        assert_eq!(cfg.fusion.w_ml, 0.0);
        assert_eq!(cfg.fusion.w_indicator, 1.0);
        assert!(cfg.validate().is_ok());
    }
}
