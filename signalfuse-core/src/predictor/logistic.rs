//! Multinomial logistic (softmax) direction model loaded from a JSON artifact.
//!
//! Classes are ordered `[DOWN, FLAT, UP]`. Inputs are standardized with the
//! artifact's per-feature mean and scale before the linear layer. The predicted
//! direction is the arg-max class; confidence is its probability.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::features::{FeatureVector, FEATURE_NAMES, FEATURE_SCHEMA_VERSION};
use super::{Direction, PredictError, Prediction, Predictor};

const CLASSES: [Direction; 3] = [Direction::Down, Direction::Flat, Direction::Up];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub version: String,
    pub schema_version: u32,
    pub feature_names: Vec<String>,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    /// One row of feature weights per class, in `[DOWN, FLAT, UP]` order.
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

impl LogisticModel {
    pub fn from_json(json: &str) -> Result<Self, PredictError> {
        let model: LogisticModel = serde_json::from_str(json)
            .map_err(|e| PredictError::InvalidModel(format!("parse: {e}")))?;
        model.validate()?;
        Ok(model)
    }

    pub fn from_file(path: &Path) -> Result<Self, PredictError> {
        let json = std::fs::read_to_string(path).map_err(|e| PredictError::ModelUnavailable {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_json(&json)
    }

    /// Reject artifacts whose shape or schema does not match the current feature set.
    pub fn validate(&self) -> Result<(), PredictError> {
        if self.schema_version != FEATURE_SCHEMA_VERSION {
            return Err(PredictError::SchemaMismatch {
                expected: FEATURE_SCHEMA_VERSION,
                found: self.schema_version,
            });
        }
        if self.feature_names.len() != FEATURE_NAMES.len()
            || self
                .feature_names
                .iter()
                .zip(FEATURE_NAMES.iter())
                .any(|(a, b)| a != b)
        {
            return Err(PredictError::InvalidModel(format!(
                "feature names {:?} do not match schema v{FEATURE_SCHEMA_VERSION}",
                self.feature_names
            )));
        }

        let n = FEATURE_NAMES.len();
        if self.means.len() != n || self.scales.len() != n {
            return Err(PredictError::InvalidModel(
                "means/scales length differs from feature count".into(),
            ));
        }
        if self.scales.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(PredictError::InvalidModel("scales must be positive".into()));
        }
        if self.weights.len() != CLASSES.len()
            || self.bias.len() != CLASSES.len()
            || self.weights.iter().any(|row| row.len() != n)
        {
            return Err(PredictError::InvalidModel(format!(
                "expected {} x {n} weights and {} biases",
                CLASSES.len(),
                CLASSES.len()
            )));
        }
        Ok(())
    }

    /// Class probabilities in `[DOWN, FLAT, UP]` order.
    pub fn probabilities(&self, features: &FeatureVector) -> [f64; 3] {
        let z: Vec<f64> = features
            .values
            .iter()
            .zip(self.means.iter().zip(&self.scales))
            .map(|(x, (m, s))| (x - m) / s)
            .collect();

        let mut logits = [0.0; 3];
        for (k, logit) in logits.iter_mut().enumerate() {
            *logit = self.bias[k]
                + self.weights[k]
                    .iter()
                    .zip(&z)
                    .map(|(w, x)| w * x)
                    .sum::<f64>();
        }

        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exp: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f64 = exp.iter().sum();
        [exp[0] / total, exp[1] / total, exp[2] / total]
    }
}

impl Predictor for LogisticModel {
    fn name(&self) -> &str {
        "logistic"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn schema_version(&self) -> u32 {
        self.schema_version
    }

    fn predict(&self, features: &FeatureVector) -> Result<Prediction, PredictError> {
        if features.values.len() != self.means.len() {
            return Err(PredictError::SchemaMismatch {
                expected: self.schema_version,
                found: features.schema_version,
            });
        }
        let probs = self.probabilities(features);
        // Ties resolve to the earlier class, which keeps the call deterministic.
        let best = (1..probs.len()).fold(0, |best, k| if probs[k] > probs[best] { k } else { best });
        Ok(Prediction {
            direction: CLASSES[best],
            confidence: probs[best],
        })
    }
}
