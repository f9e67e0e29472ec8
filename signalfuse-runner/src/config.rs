//! Serializable run configuration.
//!
//! A `RunConfig` captures everything needed to reproduce a backtest or start a
//! live paper loop: instruments, data source, date range, capital, the model
//! artifact and the engine tunables. Dates are RFC 3339 strings in TOML
//! (`start = "2024-01-01T00:00:00Z"`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use signalfuse_core::{ConfigError, EngineConfig};

use crate::live::LiveConfig;

/// Unique identifier for a run (content-addressable hash).
pub type RunId = String;

/// Where backtest candles come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// `instrument=X/timeframe=tf.parquet` files under `dir`.
    Parquet { dir: PathBuf },
    /// `{INSTRUMENT}_{tf}.csv` files under `dir`.
    Csv { dir: PathBuf },
    /// Seeded random walk, `candles` per instrument.
    Simulated { candles: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub instruments: Vec<String>,
    pub source: SourceConfig,
    /// Inclusive start of the replay range. Unbounded when absent.
    pub start: Option<DateTime<Utc>>,
    /// Exclusive end of the replay range. Unbounded when absent.
    pub end: Option<DateTime<Utc>>,
    pub initial_capital: f64,
    /// Logistic model artifact (JSON). Without one the predictor is unavailable.
    pub model_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub engine: EngineConfig,
    pub live: LiveConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            instruments: vec!["BTCUSDT".to_string()],
            source: SourceConfig::Simulated { candles: 2_000 },
            start: None,
            end: None,
            initial_capital: 10_000.0,
            model_path: None,
            output_dir: PathBuf::from("output"),
            engine: EngineConfig::default(),
            live: LiveConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.live.validate()?;

        if self.instruments.is_empty() || self.instruments.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::OutOfRange {
                field: "run.instruments",
                value: self.instruments.len() as f64,
                expected: "one or more non-empty instrument names",
            });
        }
        let unique: BTreeSet<&String> = self.instruments.iter().collect();
        if unique.len() != self.instruments.len() {
            return Err(ConfigError::OutOfRange {
                field: "run.instruments",
                value: self.instruments.len() as f64,
                expected: "unique instrument names",
            });
        }
        if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
            return Err(ConfigError::OutOfRange {
                field: "run.initial_capital",
                value: self.initial_capital,
                expected: "> 0",
            });
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start >= end {
                return Err(ConfigError::OutOfRange {
                    field: "run.end",
                    value: end.timestamp() as f64,
                    expected: "> run.start",
                });
            }
        }
        if let SourceConfig::Simulated { candles: 0 } = self.source {
            return Err(ConfigError::OutOfRange {
                field: "source.candles",
                value: 0.0,
                expected: ">= 1",
            });
        }
        Ok(())
    }

    /// Deterministic hash of this configuration and the dataset it ran on.
    ///
    /// Two runs with identical configs over identical data share a RunId.
    pub fn run_id(&self, dataset_hash: &str) -> RunId {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = blake3::Hasher::new();
        hasher.update(json.as_bytes());
        hasher.update(dataset_hash.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Hash of the inputs that determine a single replay's outcome.
pub fn config_hash(engine: &EngineConfig, dataset_hash: &str, initial_capital: f64) -> String {
    let json = serde_json::to_string(engine).unwrap_or_default();
    let mut hasher = blake3::Hasher::new();
    hasher.update(json.as_bytes());
    hasher.update(dataset_hash.as_bytes());
    hasher.update(&initial_capital.to_le_bytes());
    hasher.finalize().to_hex().to_string()
}
