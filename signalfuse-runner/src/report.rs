//! Backtest reports: one per replay, plus the with/without-ML comparison.
//!
//! Reports are plain serializable records. Every map is a `BTreeMap` so the
//! JSON form is byte-identical across runs over the same inputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use signalfuse_core::domain::{ClosedTrade, MarginViolation, Timeframe};

use crate::metrics::PerformanceMetrics;

/// Current schema version for persisted reports.
pub const SCHEMA_VERSION: u32 = 1;

/// Label of the replay that consults the predictor.
pub const WITH_ML: &str = "with_ml";
/// Label of the replay with `w_ml = 0`.
pub const WITHOUT_ML: &str = "without_ml";

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Complete result of one deterministic replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub label: String,
    /// Hash of engine config, dataset and capital.
    pub config_hash: String,
    pub dataset_hash: String,
    pub instruments: Vec<String>,
    pub base_timeframe: Timeframe,
    pub first_candle: Option<DateTime<Utc>>,
    pub last_candle: Option<DateTime<Utc>>,
    pub candle_count: usize,
    pub initial_capital: f64,
    pub final_capital: f64,
    /// Model consulted by this replay, `None` when `w_ml = 0`.
    pub model_version: Option<String>,
    /// Closed trades in the order they were realized.
    pub trades: Vec<ClosedTrade>,
    pub metrics: PerformanceMetrics,
    pub margin_violations: Vec<MarginViolation>,
    /// Mark-to-market equity: the initial capital, then one point per replay timestamp.
    pub equity_curve: Vec<f64>,
    /// Step count per action kind (`OPEN`, `HOLD`, ...).
    pub action_counts: BTreeMap<String, usize>,
    pub hold_counts: BTreeMap<String, usize>,
    pub reject_counts: BTreeMap<String, usize>,
    /// Steps where the model failed and fusion ran on indicators only.
    pub degraded_cycles: usize,
    /// Steps where the gated prediction pointed against the indicator direction.
    pub disagreement_candles: usize,
}

impl BacktestReport {
    pub fn win_rate(&self) -> f64 {
        self.metrics.win_rate
    }

    pub fn total_pnl(&self) -> f64 {
        self.metrics.total_pnl
    }

    pub fn max_drawdown(&self) -> f64 {
        self.metrics.max_drawdown
    }
}

/// Two replays over the same candles, one with the predictor and one without.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub with_ml: BacktestReport,
    pub without_ml: BacktestReport,
    /// Candles where the predictor disagreed with the indicators (with-ML run).
    pub disagreement_candles: usize,
    /// with_ml minus without_ml.
    pub trade_count_delta: i64,
    pub win_rate_delta: f64,
    pub total_pnl_delta: f64,
    pub identical_trades: bool,
}

impl ComparisonReport {
    pub fn new(with_ml: BacktestReport, without_ml: BacktestReport) -> Self {
        let trade_count_delta = with_ml.trades.len() as i64 - without_ml.trades.len() as i64;
        let win_rate_delta = with_ml.win_rate() - without_ml.win_rate();
        let total_pnl_delta = with_ml.total_pnl() - without_ml.total_pnl();
        let identical_trades = with_ml.trades == without_ml.trades;
        Self {
            schema_version: SCHEMA_VERSION,
            disagreement_candles: with_ml.disagreement_candles,
            trade_count_delta,
            win_rate_delta,
            total_pnl_delta,
            identical_trades,
            with_ml,
            without_ml,
        }
    }

    /// True when the predictor changed the outcome of the run.
    pub fn outcomes_differ(&self) -> bool {
        !self.identical_trades
    }
}
