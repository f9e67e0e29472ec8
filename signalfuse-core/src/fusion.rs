//! Signal fusion: indicator readings + gated model call → one scored decision.
//!
//! score = w_indicator * indicator_score + w_ml * ml_score
//!
//! - indicator_score: mean of three components in [-1, 1]
//!   - RSI momentum: 0 at 50, saturating at ±1 at the overbought/oversold levels
//!   - MACD: sign of the histogram (macd - signal)
//!   - Bollinger: close position inside the band
//! - ml_score: direction sign * confidence, 0 when the gated direction is FLAT
//!
//! Fused confidence = w_indicator * agreement + w_ml * ml_term, where agreement is
//! the share of indicator components on the score's side and ml_term is the model
//! confidence when it agrees, 1 - confidence when it opposes, 0.5 when FLAT.
//!
//! A decision is actionable only if |score| >= open_threshold and
//! confidence >= min_confidence.

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::domain::{CandleRef, Side, Timeframe};
use crate::indicators::IndicatorSnapshot;
use crate::predictor::{Direction, PredictionSnapshot};

const WEIGHT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub w_indicator: f64,
    pub w_ml: f64,
    pub open_threshold: f64,
    /// Predictions below this confidence count as FLAT; fused decisions below it are not actionable.
    pub min_confidence: f64,
    /// An opposing actionable signal at or above this confidence forces an exit.
    pub exit_confidence: f64,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            w_indicator: 0.5,
            w_ml: 0.5,
            open_threshold: 0.6,
            min_confidence: 0.55,
            exit_confidence: 0.75,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let in_unit = |w: f64| (0.0..=1.0).contains(&w);
        if !in_unit(self.w_indicator)
            || !in_unit(self.w_ml)
            || (self.w_indicator + self.w_ml - 1.0).abs() > WEIGHT_TOLERANCE
        {
            return Err(ConfigError::InvalidWeights {
                w_indicator: self.w_indicator,
                w_ml: self.w_ml,
            });
        }
        let unit_fields = [
            ("fusion.open_threshold", self.open_threshold),
            ("fusion.min_confidence", self.min_confidence),
            ("fusion.exit_confidence", self.exit_confidence),
        ];
        for (field, value) in unit_fields {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::OutOfRange {
                    field,
                    value,
                    expected: "(0, 1]",
                });
            }
        }
        if !(self.rsi_overbought > 50.0 && self.rsi_overbought < 100.0) {
            return Err(ConfigError::OutOfRange {
                field: "fusion.rsi_overbought",
                value: self.rsi_overbought,
                expected: "(50, 100)",
            });
        }
        if !(self.rsi_oversold > 0.0 && self.rsi_oversold < 50.0) {
            return Err(ConfigError::OutOfRange {
                field: "fusion.rsi_oversold",
                value: self.rsi_oversold,
                expected: "(0, 50)",
            });
        }
        Ok(())
    }

    /// The same thresholds with the model weight moved onto the indicators.
    pub fn indicator_only(&self) -> Self {
        Self {
            w_indicator: 1.0,
            w_ml: 0.0,
            ..self.clone()
        }
    }
}

/// Per-indicator readings, each in [-1, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorComponents {
    pub rsi: f64,
    pub macd: f64,
    pub bollinger: f64,
}

impl IndicatorComponents {
    pub fn mean(&self) -> f64 {
        (self.rsi + self.macd + self.bollinger) / 3.0
    }

    /// Share of components with the given sign (0 when `sign` is 0).
    pub fn agreement(&self, sign: f64) -> f64 {
        if sign == 0.0 {
            return 0.0;
        }
        let agreeing = [self.rsi, self.macd, self.bollinger]
            .iter()
            .filter(|c| signum0(**c) == sign)
            .count();
        agreeing as f64 / 3.0
    }
}

/// What the model contributed to a fusion.
#[derive(Debug, Clone, Copy)]
pub enum MlInput<'a> {
    /// Model weight is zero for this run; the model was not consulted.
    Disabled,
    /// The model failed; fusion falls back to indicators only.
    Unavailable,
    Prediction(&'a PredictionSnapshot),
}

/// The single scored decision for one candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedSignal {
    pub candle_ref: CandleRef,
    pub score: f64,
    pub confidence: f64,
    pub indicator_score: f64,
    pub ml_score: f64,
    pub components: IndicatorComponents,
    pub actionable: bool,
    /// The model was unavailable and its weight was moved onto the indicators.
    pub ml_degraded: bool,
    /// The gated model call points against the indicator direction.
    pub ml_disagrees: bool,
    pub contributing_timeframes: Vec<Timeframe>,
}

impl FusedSignal {
    /// LONG/SHORT bias from the score sign.
    pub fn side(&self) -> Option<Side> {
        Side::from_score(self.score)
    }
}

/// Validated fusion stage.
#[derive(Debug, Clone)]
pub struct SignalFusion {
    config: FusionConfig,
}

impl SignalFusion {
    pub fn new(config: FusionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// True when this run consults the model at all.
    pub fn uses_model(&self) -> bool {
        self.config.w_ml > 0.0
    }

    pub fn components(&self, snapshot: &IndicatorSnapshot) -> IndicatorComponents {
        IndicatorComponents {
            rsi: self.rsi_component(snapshot.rsi),
            macd: signum0(snapshot.macd_hist),
            bollinger: snapshot.bollinger_position(),
        }
    }

    fn rsi_component(&self, rsi: f64) -> f64 {
        let c = &self.config;
        let reading = if rsi >= 50.0 {
            (rsi - 50.0) / (c.rsi_overbought - 50.0)
        } else {
            (rsi - 50.0) / (50.0 - c.rsi_oversold)
        };
        reading.clamp(-1.0, 1.0)
    }

    /// Fuse one warm snapshot with the model's input. `None` during warm-up.
    ///
    /// Pure: the same snapshot and input always produce the same signal.
    pub fn fuse(&self, snapshot: &IndicatorSnapshot, ml: MlInput<'_>) -> Option<FusedSignal> {
        if !snapshot.is_ready() {
            return None;
        }

        let components = self.components(snapshot);
        let indicator_score = components.mean();

        let (w_indicator, w_ml, prediction, ml_degraded) = match ml {
            MlInput::Prediction(p) if self.uses_model() => {
                (self.config.w_indicator, self.config.w_ml, Some(p), false)
            }
            MlInput::Unavailable if self.uses_model() => (1.0, 0.0, None, true),
            _ => (1.0, 0.0, None, false),
        };

        let (direction, ml_confidence) = match prediction {
            Some(p) => (p.gated_direction(self.config.min_confidence), p.confidence),
            None => (Direction::Flat, 0.0),
        };
        let ml_score = direction.sign() * ml_confidence;

        let score = (w_indicator * indicator_score + w_ml * ml_score).clamp(-1.0, 1.0);
        let sign = signum0(score);

        let ml_term = if direction == Direction::Flat {
            0.5
        } else if direction.sign() == sign {
            ml_confidence
        } else {
            1.0 - ml_confidence
        };
        let confidence =
            (w_indicator * components.agreement(sign) + w_ml * ml_term).clamp(0.0, 1.0);

        let actionable =
            score.abs() >= self.config.open_threshold && confidence >= self.config.min_confidence;
        let ml_disagrees =
            direction != Direction::Flat && direction.sign() != signum0(indicator_score);

        Some(FusedSignal {
            candle_ref: snapshot.candle_ref.clone(),
            score,
            confidence,
            indicator_score,
            ml_score,
            components,
            actionable,
            ml_degraded,
            ml_disagrees,
            contributing_timeframes: vec![snapshot.candle_ref.timeframe],
        })
    }
}

/// Sign with 0 for zero and NaN.
fn signum0(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{make_candles, IndicatorConfig, IndicatorEngine};

    fn snapshot_after(closes: &[f64]) -> IndicatorSnapshot {
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
        for c in make_candles(closes) {
            last = Some(engine.update(&c).unwrap());
        }
        last.unwrap()
    }

    fn uptrend() -> IndicatorSnapshot {
        snapshot_after(&[100.0, 101.0, 102.0, 103.0, 104.0, 106.0, 108.0])
    }

    fn prediction(snap: &IndicatorSnapshot, direction: Direction, confidence: f64) -> PredictionSnapshot {
        PredictionSnapshot {
            candle_ref: snap.candle_ref.clone(),
            direction,
            confidence,
            model_version: "test".into(),
        }
    }

    #[test]
    fn weights_must_sum_to_one() {
        let bad = FusionConfig {
            w_indicator: 0.6,
            w_ml: 0.6,
            ..FusionConfig::default()
        };
        assert!(matches!(
            SignalFusion::new(bad),
            Err(ConfigError::InvalidWeights { .. })
        ));
        let negative = FusionConfig {
            w_indicator: 1.2,
            w_ml: -0.2,
            ..FusionConfig::default()
        };
        assert!(SignalFusion::new(negative).is_err());
        assert!(SignalFusion::new(FusionConfig::default()).is_ok());
    }

    #[test]
    fn rsi_component_saturates_at_levels() {
        let fusion = SignalFusion::new(FusionConfig::default()).unwrap();
        assert_eq!(fusion.rsi_component(50.0), 0.0);
        assert_eq!(fusion.rsi_component(70.0), 1.0);
        assert_eq!(fusion.rsi_component(90.0), 1.0);
        assert_eq!(fusion.rsi_component(30.0), -1.0);
        assert!((fusion.rsi_component(60.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn strong_uptrend_with_agreeing_model_is_actionable_long() {
        let fusion = SignalFusion::new(FusionConfig::default()).unwrap();
        let snap = uptrend();
        let pred = prediction(&snap, Direction::Up, 0.8);
        let fused = fusion.fuse(&snap, MlInput::Prediction(&pred)).unwrap();
        assert!(fused.indicator_score > 0.6);
        assert!(fused.actionable);
        assert_eq!(fused.side(), Some(Side::Long));
        assert!(!fused.ml_disagrees);
        assert!(!fused.ml_degraded);
    }

    #[test]
    fn low_confidence_prediction_is_flat() {
        let fusion = SignalFusion::new(FusionConfig::default()).unwrap();
        let snap = uptrend();
        let weak = prediction(&snap, Direction::Down, 0.5);
        let fused = fusion.fuse(&snap, MlInput::Prediction(&weak)).unwrap();
        assert_eq!(fused.ml_score, 0.0);
        assert!(!fused.ml_disagrees);
        assert!((fused.score - 0.5 * fused.indicator_score).abs() < 1e-12);
    }

    #[test]
    fn fusion_is_idempotent() {
        let fusion = SignalFusion::new(FusionConfig::default()).unwrap();
        let snap = uptrend();
        let pred = prediction(&snap, Direction::Down, 0.9);
        let a = fusion.fuse(&snap, MlInput::Prediction(&pred));
        let b = fusion.fuse(&snap, MlInput::Prediction(&pred));
        assert_eq!(a, b);
        assert!(a.unwrap().ml_disagrees);
    }

    #[test]
    fn unavailable_model_degrades_to_indicators() {
        let fusion = SignalFusion::new(FusionConfig::default()).unwrap();
        let snap = uptrend();
        let fused = fusion.fuse(&snap, MlInput::Unavailable).unwrap();
        assert!(fused.ml_degraded);
        assert_eq!(fused.score, fused.indicator_score);

        let indicator_only = SignalFusion::new(FusionConfig::default().indicator_only()).unwrap();
        let plain = indicator_only.fuse(&snap, MlInput::Disabled).unwrap();
        assert_eq!(plain.score, fused.score);
        assert!(!plain.ml_degraded);
    }

    #[test]
    fn zero_model_weight_ignores_prediction() {
        let fusion = SignalFusion::new(FusionConfig::default().indicator_only()).unwrap();
        let snap = uptrend();
        let pred = prediction(&snap, Direction::Down, 0.99);
        let with = fusion.fuse(&snap, MlInput::Prediction(&pred)).unwrap();
        let without = fusion.fuse(&snap, MlInput::Disabled).unwrap();
        assert_eq!(with.score, without.score);
        assert_eq!(with.confidence, without.confidence);
    }

    #[test]
    fn warmup_snapshot_is_not_fused() {
        let fusion = SignalFusion::new(FusionConfig::default()).unwrap();
        let snap = snapshot_after(&[100.0, 101.0]);
        assert!(fusion.fuse(&snap, MlInput::Disabled).is_none());
    }
}
