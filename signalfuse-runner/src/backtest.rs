//! Backtest replay engine.
//!
//! Drives one `DecisionOrchestrator` per instrument over the loaded candles,
//! interleaved strictly by open_time (ties broken by instrument name) so no
//! instrument sees a timestamp another has not reached yet. The replay is
//! single-threaded; `run_comparison` runs two independent replays in parallel.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use signalfuse_core::domain::{AccountState, Candle, ExitReason};
use signalfuse_core::predictor::{LogisticModel, PredictError, PredictorAdapter};
use signalfuse_core::{Action, DecisionOrchestrator, EngineConfig};

use crate::config::config_hash;
use crate::data_loader::LoadedData;
use crate::error::RunError;
use crate::metrics::PerformanceMetrics;
use crate::report::{BacktestReport, ComparisonReport, SCHEMA_VERSION, WITHOUT_ML, WITH_ML};

/// Load the model artifact behind a `PredictorAdapter`.
///
/// A missing path or unreadable file leaves the predictor unavailable (fusion
/// falls back to indicators). A malformed artifact or a schema mismatch is fatal.
pub fn load_predictor(model_path: Option<&Path>) -> Result<Arc<PredictorAdapter>, RunError> {
    let Some(path) = model_path else {
        warn!("no model configured, fusion runs on indicators only");
        return Ok(Arc::new(PredictorAdapter::unavailable()));
    };
    match LogisticModel::from_file(path) {
        Ok(model) => {
            info!(path = %path.display(), version = %model.version, "model loaded");
            Ok(Arc::new(PredictorAdapter::new(Arc::new(model))?))
        }
        Err(PredictError::ModelUnavailable { reason }) => {
            warn!(path = %path.display(), reason = %reason, "model unavailable, fusion runs on indicators only");
            Ok(Arc::new(PredictorAdapter::unavailable()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Replay `data` once through the decision pipeline.
pub fn run_backtest(
    engine: &EngineConfig,
    predictor: Arc<PredictorAdapter>,
    data: &LoadedData,
    initial_capital: f64,
    label: &str,
) -> Result<BacktestReport, RunError> {
    engine.validate()?;
    if data.timeframe != engine.timeframes.base {
        return Err(RunError::InvalidData(format!(
            "data is on {}, engine base timeframe is {}",
            data.timeframe, engine.timeframes.base
        )));
    }

    let mut orchestrators = BTreeMap::new();
    for instrument in data.instruments() {
        let orch = DecisionOrchestrator::new(instrument, engine, Arc::clone(&predictor))?;
        orchestrators.insert(instrument.to_string(), orch);
    }
    let mut account = AccountState::new(initial_capital).with_limits(engine.risk.entry_limits());

    let timeline = merge_by_time(data);
    let mut trades = Vec::new();
    let mut equity_curve = vec![account.capital()];
    let mut action_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut hold_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut reject_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut degraded_cycles = 0;
    let mut disagreement_candles = 0;

    let mut i = 0;
    while i < timeline.len() {
        let now = timeline[i].open_time;
        while i < timeline.len() && timeline[i].open_time == now {
            let candle = timeline[i];
            i += 1;
            let Some(orch) = orchestrators.get_mut(&candle.instrument) else {
                continue;
            };
            let outcome = orch.step(candle, &mut account);

            *action_counts.entry(outcome.action.kind().to_string()).or_default() += 1;
            match &outcome.action {
                Action::Hold { reason } => {
                    *hold_counts.entry(reason.as_str().to_string()).or_default() += 1;
                }
                Action::Rejected { reason } => {
                    *reject_counts.entry(reason.as_str().to_string()).or_default() += 1;
                }
                _ => {}
            }
            if outcome.ml_degraded {
                degraded_cycles += 1;
            }
            if outcome.signal.as_ref().is_some_and(|s| s.ml_disagrees) {
                disagreement_candles += 1;
            }
            if let Action::Close { trade } = outcome.action {
                trades.push(trade);
            }
        }
        let unrealized: f64 = orchestrators.values().map(DecisionOrchestrator::unrealized_pnl).sum();
        equity_curve.push(account.capital() + unrealized);
    }

    // End of data: close what is still open at each instrument's last close.
    for (instrument, orch) in orchestrators.iter_mut() {
        let (Some(price), Some(last)) = (orch.last_close(), data.candles.get(instrument).and_then(|c| c.last()))
        else {
            continue;
        };
        if let Some(trade) = orch.force_close(price, last.close_time(), ExitReason::EndOfData, &mut account) {
            trades.push(trade);
        }
    }
    if let Some(last) = equity_curve.last_mut() {
        *last = account.capital();
    }

    let metrics = PerformanceMetrics::compute(&equity_curve, &trades, data.timeframe.periods_per_year());
    let model_version = (engine.fusion.w_ml > 0.0).then(|| predictor.model_version());

    info!(
        label,
        trades = trades.len(),
        win_rate = metrics.win_rate,
        total_pnl = metrics.total_pnl,
        max_drawdown = metrics.max_drawdown,
        final_capital = account.capital(),
        degraded_cycles,
        "replay complete"
    );

    Ok(BacktestReport {
        schema_version: SCHEMA_VERSION,
        label: label.to_string(),
        config_hash: config_hash(engine, &data.dataset_hash, initial_capital),
        dataset_hash: data.dataset_hash.clone(),
        instruments: data.instruments().map(str::to_string).collect(),
        base_timeframe: data.timeframe,
        first_candle: timeline.first().map(|c| c.open_time),
        last_candle: timeline.last().map(|c| c.open_time),
        candle_count: timeline.len(),
        initial_capital: account.initial_capital(),
        final_capital: account.capital(),
        model_version,
        trades,
        metrics,
        margin_violations: account.margin_violations().to_vec(),
        equity_curve,
        action_counts,
        hold_counts,
        reject_counts,
        degraded_cycles,
        disagreement_candles,
    })
}

/// Replay with the predictor and with `w_ml = 0`, in parallel, over the same candles.
pub fn run_comparison(
    engine: &EngineConfig,
    predictor: Arc<PredictorAdapter>,
    data: &LoadedData,
    initial_capital: f64,
) -> Result<ComparisonReport, RunError> {
    let without = engine.without_ml();
    let (with_ml, without_ml) = rayon::join(
        || run_backtest(engine, Arc::clone(&predictor), data, initial_capital, WITH_ML),
        || run_backtest(&without, Arc::clone(&predictor), data, initial_capital, WITHOUT_ML),
    );
    let report = ComparisonReport::new(with_ml?, without_ml?);
    info!(
        trade_count_delta = report.trade_count_delta,
        win_rate_delta = report.win_rate_delta,
        total_pnl_delta = report.total_pnl_delta,
        disagreement_candles = report.disagreement_candles,
        "comparison complete"
    );
    Ok(report)
}

/// Every candle of every instrument, ordered by (open_time, instrument).
fn merge_by_time(data: &LoadedData) -> Vec<&Candle> {
    let mut all: Vec<&Candle> = data.candles.values().flatten().collect();
    all.sort_by(|a, b| {
        a.open_time
            .cmp(&b.open_time)
            .then_with(|| a.instrument.cmp(&b.instrument))
    });
    all
}

/// Replay window covered by `data`.
pub fn time_range(data: &LoadedData) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let first = data.candles.values().filter_map(|c| c.first()).map(|c| c.open_time).min()?;
    let last = data.candles.values().filter_map(|c| c.last()).map(|c| c.open_time).max()?;
    Some((first, last))
}
