//! Predictor adapter: a fixed inference contract in front of a swappable model.
//!
//! Callers pin the active model once per decision cycle (`PredictorAdapter::pin`)
//! and use that pin for every prediction in the cycle. `swap` replaces the model
//! for subsequent cycles only, so a swap never lands mid-cycle.
//!
//! Models are pure: the same feature vector always yields the same prediction.
//! Training is out of scope; a model arrives as a versioned artifact.

pub mod features;
pub mod logistic;

pub use features::{FeatureSchema, FeatureVector, FEATURE_NAMES, FEATURE_SCHEMA_VERSION};
pub use logistic::LogisticModel;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::domain::CandleRef;
use crate::indicators::IndicatorSnapshot;

/// Predicted price direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Up,
    Down,
    Flat,
}

impl Direction {
    /// +1 for UP, -1 for DOWN, 0 for FLAT.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => -1.0,
            Direction::Flat => 0.0,
        }
    }
}

/// Raw model output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub direction: Direction,
    pub confidence: f64,
}

/// A model's call for one candle.
///
/// `direction` is the model's raw call; the confidence gate is applied by fusion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSnapshot {
    pub candle_ref: CandleRef,
    pub direction: Direction,
    pub confidence: f64,
    pub model_version: String,
}

impl PredictionSnapshot {
    /// Direction after the confidence gate: FLAT below `min_confidence`.
    pub fn gated_direction(&self, min_confidence: f64) -> Direction {
        if self.confidence < min_confidence {
            Direction::Flat
        } else {
            self.direction
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PredictError {
    #[error("model unavailable: {reason}")]
    ModelUnavailable { reason: String },

    #[error("feature schema mismatch: expected v{expected}, found v{found}")]
    SchemaMismatch { expected: u32, found: u32 },

    #[error("invalid model artifact: {0}")]
    InvalidModel(String),
}

/// A trained direction model.
pub trait Predictor: Send + Sync {
    /// Human-readable model family name.
    fn name(&self) -> &str;

    /// Artifact version, recorded on every prediction.
    fn version(&self) -> &str;

    /// Feature schema version the model was trained against.
    fn schema_version(&self) -> u32;

    fn predict(&self, features: &FeatureVector) -> Result<Prediction, PredictError>;
}

/// Holds the active model and swaps it between cycles.
pub struct PredictorAdapter {
    active: RwLock<Arc<dyn Predictor>>,
}

impl PredictorAdapter {
    /// Wrap a model. Fails if the model was trained on another feature schema.
    pub fn new(model: Arc<dyn Predictor>) -> Result<Self, PredictError> {
        check_schema(model.as_ref())?;
        Ok(Self {
            active: RwLock::new(model),
        })
    }

    /// Adapter with no model loaded; every prediction is `ModelUnavailable`.
    pub fn unavailable() -> Self {
        Self {
            active: RwLock::new(Arc::new(UnavailablePredictor)),
        }
    }

    /// Replace the active model. Cycles already holding a pin keep the old one.
    pub fn swap(&self, model: Arc<dyn Predictor>) -> Result<(), PredictError> {
        check_schema(model.as_ref())?;
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        tracing::info!(
            from = active.version(),
            to = model.version(),
            model = model.name(),
            "predictor model swapped"
        );
        *active = model;
        Ok(())
    }

    /// Pin the active model for one decision cycle.
    pub fn pin(&self) -> PinnedModel {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        PinnedModel {
            model: Arc::clone(&active),
        }
    }

    pub fn model_version(&self) -> String {
        self.pin().model.version().to_string()
    }
}

impl std::fmt::Debug for PredictorAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pin = self.pin();
        f.debug_struct("PredictorAdapter")
            .field("model", &pin.model.name())
            .field("version", &pin.model.version())
            .finish()
    }
}

fn check_schema(model: &dyn Predictor) -> Result<(), PredictError> {
    if model.schema_version() != FEATURE_SCHEMA_VERSION {
        return Err(PredictError::SchemaMismatch {
            expected: FEATURE_SCHEMA_VERSION,
            found: model.schema_version(),
        });
    }
    Ok(())
}

/// The model in force for one cycle.
#[derive(Clone)]
pub struct PinnedModel {
    model: Arc<dyn Predictor>,
}

impl PinnedModel {
    pub fn version(&self) -> &str {
        self.model.version()
    }

    /// Predict from a warm indicator snapshot.
    ///
    /// Returns `Ok(None)` while the snapshot is still warming up.
    pub fn predict(
        &self,
        snapshot: &IndicatorSnapshot,
    ) -> Result<Option<PredictionSnapshot>, PredictError> {
        let Some(features) = FeatureVector::from_snapshot(snapshot) else {
            return Ok(None);
        };
        if features.schema_version != self.model.schema_version() {
            return Err(PredictError::SchemaMismatch {
                expected: self.model.schema_version(),
                found: features.schema_version,
            });
        }

        let raw = self.model.predict(&features)?;
        if !raw.confidence.is_finite() {
            return Err(PredictError::ModelUnavailable {
                reason: format!("{} produced a non-finite confidence", self.model.name()),
            });
        }

        Ok(Some(PredictionSnapshot {
            candle_ref: snapshot.candle_ref.clone(),
            direction: raw.direction,
            confidence: raw.confidence.clamp(0.0, 1.0),
            model_version: self.model.version().to_string(),
        }))
    }
}

/// Stand-in for "no model loaded".
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailablePredictor;

impl Predictor for UnavailablePredictor {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn version(&self) -> &str {
        "none"
    }

    fn schema_version(&self) -> u32 {
        FEATURE_SCHEMA_VERSION
    }

    fn predict(&self, _features: &FeatureVector) -> Result<Prediction, PredictError> {
        Err(PredictError::ModelUnavailable {
            reason: "no model loaded".into(),
        })
    }
}

/// Returns the same prediction for every input.
///
/// Used for mocked runs and as a fixed prior.
#[derive(Debug, Clone)]
pub struct StaticPredictor {
    prediction: Prediction,
    version: String,
}

impl StaticPredictor {
    pub fn new(direction: Direction, confidence: f64) -> Self {
        Self {
            prediction: Prediction {
                direction,
                confidence,
            },
            version: format!("static-{direction:?}-{confidence}").to_lowercase(),
        }
    }
}

impl Predictor for StaticPredictor {
    fn name(&self) -> &str {
        "static"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn schema_version(&self) -> u32 {
        FEATURE_SCHEMA_VERSION
    }

    fn predict(&self, _features: &FeatureVector) -> Result<Prediction, PredictError> {
        Ok(self.prediction)
    }
}
