//! SignalFuse Runner: backtest replay, comparison reports, live paper trading.
//!
//! This crate builds on `signalfuse-core` to provide:
//! - Run configuration (TOML) with content-addressed run ids
//! - Candle loading from Parquet, CSV or the simulated walk, with validation
//! - Deterministic multi-instrument backtest replay and the with/without-ML comparison
//! - Performance metrics and JSON/CSV/Markdown export
//! - The live paper-trading loop and its single-writer capital ledger

pub mod backtest;
pub mod config;
pub mod data_loader;
pub mod error;
pub mod export;
pub mod ledger;
pub mod live;
pub mod metrics;
pub mod report;

pub use backtest::{load_predictor, run_backtest, run_comparison};
pub use config::{config_hash, RunConfig, RunId, SourceConfig};
pub use data_loader::{load_candles, LoadedData};
pub use error::RunError;
pub use ledger::{LedgerHandle, LedgerService};
pub use live::{binance_source, CycleReport, CycleStatus, LiveConfig, LiveRunner, LiveSummary};
pub use metrics::PerformanceMetrics;
pub use report::{BacktestReport, ComparisonReport, SCHEMA_VERSION};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn performance_metrics_is_send_sync() {
        assert_send::<PerformanceMetrics>();
        assert_sync::<PerformanceMetrics>();
    }

    #[test]
    fn reports_are_send_sync() {
        assert_send::<BacktestReport>();
        assert_sync::<BacktestReport>();
        assert_send::<ComparisonReport>();
        assert_sync::<ComparisonReport>();
    }

    #[test]
    fn config_types_are_send_sync() {
        assert_send::<RunConfig>();
        assert_sync::<RunConfig>();
        assert_send::<LiveConfig>();
        assert_sync::<LiveConfig>();
    }

    #[test]
    fn loaded_data_is_send_sync() {
        assert_send::<LoadedData>();
        assert_sync::<LoadedData>();
    }

    #[test]
    fn ledger_handle_crosses_threads() {
        assert_send::<LedgerHandle>();
        assert_send::<CycleReport>();
    }

    #[test]
    fn live_runner_is_shareable() {
        assert_send::<LiveRunner>();
        assert_sync::<LiveRunner>();
    }
}
