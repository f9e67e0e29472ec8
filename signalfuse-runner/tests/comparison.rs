//! With/without-ML comparison on a fixed 30-candle uptrend.
//!
//! The indicators alone open LONG on the MACD crossover and take profit twice.
//! A predictor that agrees (UP, 0.8) leaves the trade list unchanged; one that
//! fights the trend (DOWN, 0.9) suppresses every entry. Both reports are kept
//! separately, and the runs differ only when the predictor disagreed with the
//! indicators on at least one candle.

use chrono::{TimeZone, Utc};
use std::sync::Arc;

use signalfuse_core::aggregator::TimeframeConfig;
use signalfuse_core::data::SourceKind;
use signalfuse_core::domain::{Candle, ExitReason, Timeframe};
use signalfuse_core::indicators::IndicatorConfig;
use signalfuse_core::predictor::{Direction, PredictorAdapter, StaticPredictor};
use signalfuse_core::EngineConfig;
use signalfuse_runner::export::{export_comparison_json, save_comparison};
use signalfuse_runner::report::{WITHOUT_ML, WITH_ML};
use signalfuse_runner::{run_comparison, LoadedData};

const CLOSES: [f64; 30] = [
    100.0, 100.5, 100.0, 103.0, 106.0, 109.0, 109.2, 109.4, 109.6, 109.8, 110.0, 110.2, 110.4,
    110.6, 110.8, 111.0, 111.2, 111.4, 112.9, 114.4, 115.9, 117.4, 118.9, 120.4, 121.9, 123.4,
    124.9, 126.4, 127.9, 129.4,
];

fn uptrend() -> LoadedData {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let candles: Vec<Candle> = CLOSES
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { CLOSES[i - 1] };
            Candle {
                instrument: "BTCUSDT".into(),
                timeframe: Timeframe::M5,
                open_time: start + Timeframe::M5.duration() * i as i32,
                open,
                high: open.max(close) * 1.001,
                low: open.min(close) * 0.999,
                close,
                volume: 1000.0,
            }
        })
        .collect();
    LoadedData::from_candles(Timeframe::M5, candles, SourceKind::Csv).unwrap()
}

fn config() -> EngineConfig {
    EngineConfig {
        indicators: IndicatorConfig {
            rsi_period: 5,
            macd_fast: 4,
            macd_slow: 8,
            macd_signal: 4,
            bollinger_period: 5,
            bollinger_std: 2.0,
        },
        timeframes: TimeframeConfig {
            higher: vec![],
            ..TimeframeConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn predictor(direction: Direction, confidence: f64) -> Arc<PredictorAdapter> {
    Arc::new(PredictorAdapter::new(Arc::new(StaticPredictor::new(direction, confidence))).unwrap())
}

#[test]
fn indicator_only_run_takes_profit_on_the_uptrend() {
    let cmp = run_comparison(&config(), predictor(Direction::Up, 0.8), &uptrend(), 10_000.0).unwrap();
    let trades = &cmp.without_ml.trades;

    assert_eq!(cmp.without_ml.label, WITHOUT_ML);
    assert_eq!(trades.len(), 3);
    assert_eq!(trades[0].exit_reason, ExitReason::TakeProfit);
    assert_eq!(trades[1].exit_reason, ExitReason::TakeProfit);
    assert!(trades[0].net_pnl > 0.0 && trades[1].net_pnl > 0.0);
    // Opened on the last candle, closed flat minus fees at end of data.
    assert_eq!(trades[2].exit_reason, ExitReason::EndOfData);
    assert!(cmp.without_ml.final_capital > 10_000.0);
}

#[test]
fn agreeing_predictor_changes_nothing() {
    let cmp = run_comparison(&config(), predictor(Direction::Up, 0.8), &uptrend(), 10_000.0).unwrap();

    assert_eq!(cmp.with_ml.label, WITH_ML);
    assert_eq!(cmp.disagreement_candles, 0);
    assert_eq!(cmp.trade_count_delta, 0);
    assert_eq!(cmp.win_rate_delta, 0.0);
    let kinds = |r: &signalfuse_runner::BacktestReport| {
        r.trades
            .iter()
            .map(|t| (t.entry_time, t.exit_time, t.exit_reason))
            .collect::<Vec<_>>()
    };
    assert_eq!(kinds(&cmp.with_ml), kinds(&cmp.without_ml));
}

#[test]
fn contrarian_predictor_suppresses_entries() {
    let cmp = run_comparison(&config(), predictor(Direction::Down, 0.9), &uptrend(), 10_000.0).unwrap();

    assert!(cmp.disagreement_candles > 0);
    assert!(cmp.with_ml.trades.is_empty());
    assert_eq!(cmp.without_ml.trades.len(), 3);
    assert_eq!(cmp.trade_count_delta, -3);
    assert!(cmp.outcomes_differ());
    assert_eq!(cmp.with_ml.final_capital, 10_000.0);
    assert_eq!(cmp.without_ml.disagreement_candles, 0);
}

#[test]
fn reports_are_separate_and_persisted() {
    let cmp = run_comparison(&config(), predictor(Direction::Down, 0.9), &uptrend(), 10_000.0).unwrap();
    assert_ne!(cmp.with_ml.label, cmp.without_ml.label);
    assert_eq!(cmp.with_ml.dataset_hash, cmp.without_ml.dataset_hash);
    assert_eq!(cmp.with_ml.equity_curve.len(), cmp.without_ml.equity_curve.len());

    let dir = tempfile::tempdir().unwrap();
    let run_dir = save_comparison(&cmp, dir.path(), "deadbeefcafe0000").unwrap();
    assert!(run_dir.join(WITH_ML).join("trades.csv").exists());
    assert!(run_dir.join(WITHOUT_ML).join("trades.csv").exists());

    let again = run_comparison(&config(), predictor(Direction::Down, 0.9), &uptrend(), 10_000.0).unwrap();
    assert_eq!(export_comparison_json(&cmp).unwrap(), export_comparison_json(&again).unwrap());
}
