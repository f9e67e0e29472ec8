//! End-to-end decision scenario on a fixed 30-candle uptrend.
//!
//! Series: a flat start, a short spike that drives RSI past 70 while MACD is
//! still below its signal, a slow grind, then a steady climb in which MACD
//! crosses above its signal. A mocked predictor always answers (UP, 0.8).
//!
//! Expected: warm-up rejections, threshold rejections while MACD lags, OPEN LONG
//! on the crossover candle with SL/TP per config, trailing adjustments, and a
//! take-profit CLOSE with positive PnL.

use chrono::{TimeZone, Utc};
use std::sync::Arc;

use signalfuse_core::aggregator::TimeframeConfig;
use signalfuse_core::domain::{AccountState, Candle, ExitReason, Side, Timeframe};
use signalfuse_core::indicators::IndicatorConfig;
use signalfuse_core::predictor::{Direction, PredictorAdapter, StaticPredictor};
use signalfuse_core::{Action, DecisionOrchestrator, EngineConfig, RejectReason, StepOutcome};

const CLOSES: [f64; 30] = [
    100.0, 100.5, 100.0, 103.0, 106.0, 109.0, 109.2, 109.4, 109.6, 109.8, 110.0, 110.2, 110.4,
    110.6, 110.8, 111.0, 111.2, 111.4, 112.9, 114.4, 115.9, 117.4, 118.9, 120.4, 121.9, 123.4,
    124.9, 126.4, 127.9, 129.4,
];

fn candles() -> Vec<Candle> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    CLOSES
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
        .collect()
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

fn run(config: &EngineConfig) -> (Vec<StepOutcome>, AccountState) {
    let adapter = PredictorAdapter::new(Arc::new(StaticPredictor::new(Direction::Up, 0.8))).unwrap();
    let mut orch = DecisionOrchestrator::new("BTCUSDT", config, Arc::new(adapter)).unwrap();
    let mut account = AccountState::new(10_000.0);
    let outcomes = candles().iter().map(|c| orch.step(c, &mut account)).collect();
    (outcomes, account)
}

#[test]
fn uptrend_opens_long_on_crossover_and_takes_profit() {
    let (outcomes, account) = run(&config());

    for o in &outcomes[..10] {
        assert_eq!(o.action, Action::rejected(RejectReason::WarmUp));
    }

    // RSI is above 70 from candle 10 on, but MACD stays below its signal until 19.
    for o in &outcomes[10..19] {
        assert_eq!(o.action, Action::rejected(RejectReason::BelowThreshold));
        let rsi_component = o.signal.as_ref().unwrap().components.rsi;
        assert_eq!(rsi_component, 1.0);
        assert_eq!(o.signal.as_ref().unwrap().components.macd, -1.0);
    }

    match &outcomes[19].action {
        Action::Open {
            side,
            entry_price,
            notional,
            stop_loss,
            take_profit,
            ..
        } => {
            assert_eq!(*side, Side::Long);
            assert_eq!(*entry_price, 114.4);
            assert!((notional - 2_500.0).abs() < 1e-6);
            assert!((stop_loss - 112.112).abs() < 1e-9);
            assert!((take_profit - 120.12).abs() < 1e-9);
        }
        other => panic!("expected OPEN LONG at the crossover candle, got {other:?}"),
    }
    assert_eq!(outcomes[19].signal.as_ref().unwrap().components.macd, 1.0);

    assert!(matches!(outcomes[20].action, Action::Hold { .. }));
    match (&outcomes[21].action, &outcomes[22].action) {
        (Action::Adjust { stop_loss: a }, Action::Adjust { stop_loss: b }) => {
            assert!((a - 117.4 * 0.99).abs() < 1e-9);
            assert!((b - 118.9 * 0.99).abs() < 1e-9);
        }
        other => panic!("expected two trailing adjustments, got {other:?}"),
    }

    match &outcomes[23].action {
        Action::Close { trade } => {
            assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
            assert!((trade.exit_price - 120.12).abs() < 1e-9);
            assert!((trade.net_pnl - 119.875).abs() < 1e-6);
            assert!(trade.net_pnl > 0.0);
            assert_eq!(trade.candles_held, 4);
        }
        other => panic!("expected take-profit CLOSE, got {other:?}"),
    }

    // Second round trip on the continuing trend.
    assert!(matches!(outcomes[24].action, Action::Open { .. }));
    match &outcomes[28].action {
        Action::Close { trade } => {
            assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
            assert!((trade.net_pnl - 121.312).abs() < 1e-3);
        }
        other => panic!("expected second take-profit CLOSE, got {other:?}"),
    }
    assert!(matches!(outcomes[29].action, Action::Open { .. }));

    assert!(account.capital() > 10_000.0);
    assert!(account.margin_violations().is_empty());
}

#[test]
fn indicator_only_run_takes_the_same_trades_here() {
    let (with_ml, _) = run(&config());
    let (without_ml, _) = run(&config().without_ml());

    let kinds = |v: &[StepOutcome]| v.iter().map(|o| o.action.kind()).collect::<Vec<_>>();
    assert_eq!(kinds(&with_ml), kinds(&without_ml));
    assert!(with_ml
        .iter()
        .filter_map(|o| o.signal.as_ref())
        .all(|s| !s.ml_disagrees));
}

#[test]
fn replay_is_deterministic() {
    let (a, acct_a) = run(&config());
    let (b, acct_b) = run(&config());
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
    assert_eq!(acct_a, acct_b);
}
