use thiserror::Error;

use signalfuse_core::data::{DataFetchError, StoreError};
use signalfuse_core::indicators::SequenceError;
use signalfuse_core::predictor::PredictError;
use signalfuse_core::ConfigError;

/// Errors from the runner.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sequence error: {0}")]
    Sequence(#[from] SequenceError),
    #[error("model error: {0}")]
    Model(#[from] PredictError),
    #[error("fetch error: {0}")]
    Fetch(#[from] DataFetchError),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("no candles to replay")]
    NoData,
    #[error("live loop error: {0}")]
    Live(String),
}
