//! Multi-timeframe alignment onto the decision (base) timeframe.
//!
//! Each configured timeframe owns an indicator pipeline. Base candles drive the
//! base pipeline directly and feed one `Resampler` per higher timeframe; a higher
//! pipeline only advances when its window has closed, so between closes it keeps
//! its last fused signal. Higher timeframes can veto an entry that opposes them
//! but never trigger one.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ConfigError;
use crate::domain::{Candle, Timeframe};
use crate::fusion::{FusedSignal, MlInput, SignalFusion};
use crate::indicators::{IndicatorConfig, IndicatorEngine, IndicatorSnapshot, SequenceError};
use crate::predictor::{PinnedModel, PredictionSnapshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeframeConfig {
    /// Decision timeframe. Every incoming candle must be on it.
    pub base: Timeframe,
    /// Context timeframes, each a strict multiple of `base`.
    pub higher: Vec<Timeframe>,
    /// Minimum opposing |score| for a higher timeframe to veto an entry.
    pub veto_threshold: f64,
}

impl Default for TimeframeConfig {
    fn default() -> Self {
        Self {
            base: Timeframe::M5,
            higher: vec![Timeframe::M15, Timeframe::H1],
            veto_threshold: 0.2,
        }
    }
}

impl TimeframeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, tf) in self.higher.iter().enumerate() {
            if !tf.is_multiple_of(self.base) {
                return Err(ConfigError::InvalidTimeframes(format!(
                    "{tf} is not a multiple of base timeframe {}",
                    self.base
                )));
            }
            if self.higher[..i].contains(tf) {
                return Err(ConfigError::InvalidTimeframes(format!("{tf} listed twice")));
            }
        }
        if !(self.veto_threshold > 0.0 && self.veto_threshold <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "timeframes.veto_threshold",
                value: self.veto_threshold,
                expected: "(0, 1]",
            });
        }
        Ok(())
    }

    /// Base followed by the higher timeframes.
    pub fn all(&self) -> Vec<Timeframe> {
        std::iter::once(self.base).chain(self.higher.iter().copied()).collect()
    }
}

/// Folds base candles into candles of a larger timeframe.
#[derive(Debug, Clone)]
pub struct Resampler {
    timeframe: Timeframe,
    current: Option<Candle>,
}

impl Resampler {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            current: None,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Add one base candle and return the windows that closed with it, oldest first.
    ///
    /// A window closes when a base candle ending at its boundary arrives, or when
    /// a later candle skips past it (the partial window is emitted as is).
    pub fn push(&mut self, candle: &Candle) -> Vec<Candle> {
        let mut closed = Vec::new();
        let window = self.timeframe.window_start(candle.open_time);

        match &mut self.current {
            Some(cur) if cur.open_time == window => {
                cur.high = cur.high.max(candle.high);
                cur.low = cur.low.min(candle.low);
                cur.close = candle.close;
                cur.volume += candle.volume;
            }
            slot => {
                if let Some(prev) = slot.take() {
                    closed.push(prev);
                }
                *slot = Some(Candle {
                    timeframe: self.timeframe,
                    open_time: window,
                    ..candle.clone()
                });
            }
        }

        if candle.close_time() >= window + self.timeframe.duration() {
            if let Some(done) = self.current.take() {
                closed.push(done);
            }
        }
        closed
    }
}

/// A higher timeframe blocking an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Veto {
    pub timeframe: Timeframe,
    pub score: f64,
}

/// Everything the orchestrator needs about one base candle.
#[derive(Debug, Clone)]
pub struct AlignedSignal {
    pub snapshot: IndicatorSnapshot,
    pub prediction: Option<PredictionSnapshot>,
    /// `None` while the base timeframe is warming up.
    pub fused: Option<FusedSignal>,
    pub veto: Option<Veto>,
    /// The model failed on this candle and fusion ran on indicators only.
    pub ml_degraded: bool,
}

#[derive(Debug, Clone)]
struct Pipeline {
    timeframe: Timeframe,
    engine: IndicatorEngine,
    last: Option<FusedSignal>,
}

impl Pipeline {
    fn new(timeframe: Timeframe, config: &IndicatorConfig) -> Self {
        Self {
            timeframe,
            engine: IndicatorEngine::new(config.clone()),
            last: None,
        }
    }

    fn reset(&mut self) {
        self.engine.reset();
        self.last = None;
    }
}

#[derive(Debug, Clone)]
struct HigherTimeframe {
    resampler: Resampler,
    pipeline: Pipeline,
}

/// Per-instrument stack of timeframe pipelines.
#[derive(Debug, Clone)]
pub struct MultiTimeframeAggregator {
    config: TimeframeConfig,
    base: Pipeline,
    higher: Vec<HigherTimeframe>,
}

impl MultiTimeframeAggregator {
    pub fn new(indicators: &IndicatorConfig, config: TimeframeConfig) -> Self {
        let higher = config
            .higher
            .iter()
            .map(|&tf| HigherTimeframe {
                resampler: Resampler::new(tf),
                pipeline: Pipeline::new(tf, indicators),
            })
            .collect();
        Self {
            base: Pipeline::new(config.base, indicators),
            higher,
            config,
        }
    }

    pub fn config(&self) -> &TimeframeConfig {
        &self.config
    }

    pub fn base_timeframe(&self) -> Timeframe {
        self.config.base
    }

    /// Last fused signal of a timeframe's pipeline.
    pub fn last_signal(&self, timeframe: Timeframe) -> Option<&FusedSignal> {
        if timeframe == self.config.base {
            return self.base.last.as_ref();
        }
        self.higher
            .iter()
            .find(|h| h.pipeline.timeframe == timeframe)
            .and_then(|h| h.pipeline.last.as_ref())
    }

    /// Advance every pipeline with one base candle.
    ///
    /// An out-of-order candle fails before any pipeline is touched.
    pub fn update(
        &mut self,
        candle: &Candle,
        model: &PinnedModel,
        fusion: &SignalFusion,
    ) -> Result<AlignedSignal, SequenceError> {
        let snapshot = self.base.engine.update(candle)?;

        for h in &mut self.higher {
            for closed in h.resampler.push(candle) {
                let snap = h.pipeline.engine.update(&closed)?;
                let (_, fused, _) = evaluate(&snap, model, fusion);
                if fused.is_some() {
                    h.pipeline.last = fused;
                }
            }
        }

        let (prediction, fused, ml_degraded) = evaluate(&snapshot, model, fusion);
        let fused = fused.map(|mut signal| {
            signal.contributing_timeframes = std::iter::once(self.config.base)
                .chain(
                    self.higher
                        .iter()
                        .filter(|h| h.pipeline.last.is_some())
                        .map(|h| h.pipeline.timeframe),
                )
                .collect();
            signal
        });
        self.base.last = fused.clone();

        let veto = fused.as_ref().and_then(|base| {
            find_veto(
                base,
                self.higher
                    .iter()
                    .filter_map(|h| h.pipeline.last.as_ref().map(|s| (h.pipeline.timeframe, s))),
                self.config.veto_threshold,
            )
        });

        Ok(AlignedSignal {
            snapshot,
            prediction,
            fused,
            veto,
            ml_degraded,
        })
    }

    /// Forget all indicator history and partial higher-timeframe windows.
    pub fn reset(&mut self) {
        self.base.reset();
        for h in &mut self.higher {
            h.resampler = Resampler::new(h.pipeline.timeframe);
            h.pipeline.reset();
        }
    }
}

/// Run the model (if this fusion uses one) and fuse.
fn evaluate(
    snapshot: &IndicatorSnapshot,
    model: &PinnedModel,
    fusion: &SignalFusion,
) -> (Option<PredictionSnapshot>, Option<FusedSignal>, bool) {
    if !fusion.uses_model() {
        return (None, fusion.fuse(snapshot, MlInput::Disabled), false);
    }
    match model.predict(snapshot) {
        Ok(Some(p)) => {
            let fused = fusion.fuse(snapshot, MlInput::Prediction(&p));
            (Some(p), fused, false)
        }
        Ok(None) => (None, fusion.fuse(snapshot, MlInput::Disabled), false),
        Err(e) => {
            warn!(
                instrument = %snapshot.candle_ref.instrument,
                timeframe = %snapshot.candle_ref.timeframe,
                error = %e,
                "predictor unavailable, fusing indicators only"
            );
            (None, fusion.fuse(snapshot, MlInput::Unavailable), true)
        }
    }
}

/// First higher timeframe whose score opposes the base score by at least `threshold`.
pub(crate) fn find_veto<'a>(
    base: &FusedSignal,
    higher: impl IntoIterator<Item = (Timeframe, &'a FusedSignal)>,
    threshold: f64,
) -> Option<Veto> {
    let side = base.side()?;
    higher
        .into_iter()
        .find(|(_, s)| s.side() == Some(side.opposite()) && s.score.abs() >= threshold)
        .map(|(timeframe, s)| Veto {
            timeframe,
            score: s.score,
        })
}
