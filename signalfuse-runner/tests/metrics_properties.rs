//! Property tests for report metrics.
//!
//! 1. Drawdown is a fraction in [-1, 0] for any positive equity path
//! 2. Win rate, profit factor and streak lengths stay in range for any PnL list
//! 3. Expectancy equals mean net PnL

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

use signalfuse_core::domain::{ClosedTrade, ExitReason, Side};
use signalfuse_runner::metrics::{
    expectancy, max_consecutive_losses, max_consecutive_wins, max_drawdown, profit_factor, win_rate,
};
use signalfuse_runner::PerformanceMetrics;

fn trade(i: usize, net_pnl: f64) -> ClosedTrade {
    let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(5 * i as i64);
    ClosedTrade {
        instrument: "BTCUSDT".into(),
        side: Side::Long,
        entry_time: t,
        exit_time: t + Duration::minutes(5),
        entry_price: 100.0,
        exit_price: 100.0 + net_pnl,
        size: 1.0,
        gross_pnl: net_pnl,
        fees: 0.0,
        net_pnl,
        return_pct: net_pnl / 100.0,
        exit_reason: ExitReason::OpposingSignal,
        candles_held: 1,
        margin_capped: false,
    }
}

fn trades(pnls: &[f64]) -> Vec<ClosedTrade> {
    pnls.iter().enumerate().map(|(i, p)| trade(i, *p)).collect()
}

proptest! {
    #[test]
    fn drawdown_is_a_bounded_fraction(equity in prop::collection::vec(1.0..100_000.0_f64, 1..300)) {
        let dd = max_drawdown(&equity);
        prop_assert!((-1.0..=0.0).contains(&dd));
    }

    #[test]
    fn monotone_equity_has_no_drawdown(steps in prop::collection::vec(0.0..50.0_f64, 1..200)) {
        let mut equity = vec![1_000.0];
        for s in steps {
            let last = *equity.last().unwrap();
            equity.push(last + s);
        }
        prop_assert_eq!(max_drawdown(&equity), 0.0);
    }

    #[test]
    fn trade_statistics_stay_in_range(pnls in prop::collection::vec(-500.0..500.0_f64, 0..120)) {
        let ts = trades(&pnls);
        let wr = win_rate(&ts);
        prop_assert!((0.0..=1.0).contains(&wr));

        let pf = profit_factor(&ts);
        prop_assert!((0.0..=100.0).contains(&pf));

        prop_assert!(max_consecutive_wins(&ts) + max_consecutive_losses(&ts) <= ts.len());
    }

    #[test]
    fn expectancy_is_mean_net_pnl(pnls in prop::collection::vec(-500.0..500.0_f64, 1..120)) {
        let ts = trades(&pnls);
        let mean = pnls.iter().sum::<f64>() / pnls.len() as f64;
        prop_assert!((expectancy(&ts) - mean).abs() < 1e-6);
    }

    #[test]
    fn computed_metrics_count_every_trade(pnls in prop::collection::vec(-100.0..100.0_f64, 0..60)) {
        let ts = trades(&pnls);
        let mut equity = vec![10_000.0];
        for p in &pnls {
            let last = *equity.last().unwrap();
            equity.push(last + p);
        }
        let m = PerformanceMetrics::compute(&equity, &ts, 105_120.0);
        prop_assert_eq!(m.trade_count, ts.len());
        prop_assert!((m.total_pnl - pnls.iter().sum::<f64>()).abs() < 1e-6);
        prop_assert!(m.sharpe.is_finite());
    }
}
