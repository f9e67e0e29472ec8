//! Performance metrics as pure functions over an equity curve and a trade list.
//!
//! The equity curve is marked to market once per replay timestamp, so per-period
//! returns are per-candle returns; ratios are annualized with the base
//! timeframe's periods per year.

use serde::{Deserialize, Serialize};
use signalfuse_core::domain::ClosedTrade;

/// Profit factor reported when there are wins and no losses.
const PROFIT_FACTOR_CAP: f64 = 100.0;

/// Aggregate performance metrics for a single replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_pnl: f64,
    pub total_return: f64,
    pub max_drawdown: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub expectancy: f64,
    pub trade_count: usize,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    pub avg_candles_held: f64,
}

impl PerformanceMetrics {
    /// Compute all metrics. `periods_per_year` annualizes Sharpe and Sortino.
    pub fn compute(equity_curve: &[f64], trades: &[ClosedTrade], periods_per_year: f64) -> Self {
        Self {
            total_pnl: total_pnl(trades),
            total_return: total_return(equity_curve),
            max_drawdown: max_drawdown(equity_curve),
            sharpe: sharpe_ratio(equity_curve, periods_per_year),
            sortino: sortino_ratio(equity_curve, periods_per_year),
            win_rate: win_rate(trades),
            profit_factor: profit_factor(trades),
            avg_win: avg_win(trades),
            avg_loss: avg_loss(trades),
            expectancy: expectancy(trades),
            trade_count: trades.len(),
            max_consecutive_wins: max_consecutive_wins(trades),
            max_consecutive_losses: max_consecutive_losses(trades),
            avg_candles_held: avg_candles_held(trades),
        }
    }
}

// ─── Individual metric functions ────────────────────────────────────

/// Sum of realized net PnL.
pub fn total_pnl(trades: &[ClosedTrade]) -> f64 {
    trades.iter().map(|t| t.net_pnl).sum()
}

/// Total return as a fraction: (final - initial) / initial.
pub fn total_return(equity_curve: &[f64]) -> f64 {
    let (Some(&initial), Some(&final_eq)) = (equity_curve.first(), equity_curve.last()) else {
        return 0.0;
    };
    if equity_curve.len() < 2 || initial <= 0.0 {
        return 0.0;
    }
    (final_eq - initial) / initial
}

/// Annualized Sharpe ratio from per-period returns (zero risk-free rate).
///
/// Returns 0.0 if variance is zero or there are fewer than 2 returns.
pub fn sharpe_ratio(equity_curve: &[f64], periods_per_year: f64) -> f64 {
    let returns = period_returns(equity_curve);
    if returns.len() < 2 {
        return 0.0;
    }
    let std = std_dev(&returns);
    if std < 1e-15 {
        return 0.0;
    }
    mean_f64(&returns) / std * periods_per_year.sqrt()
}

/// Annualized Sortino ratio (downside deviation only).
///
/// Returns 0.0 when there is no downside or fewer than 2 returns.
pub fn sortino_ratio(equity_curve: &[f64], periods_per_year: f64) -> f64 {
    let returns = period_returns(equity_curve);
    if returns.len() < 2 {
        return 0.0;
    }
    let downside_sq: Vec<f64> = returns.iter().filter(|&&r| r < 0.0).map(|r| r * r).collect();
    if downside_sq.is_empty() {
        return 0.0;
    }
    let downside_dev = (downside_sq.iter().sum::<f64>() / returns.len() as f64).sqrt();
    if downside_dev < 1e-15 {
        return 0.0;
    }
    mean_f64(&returns) / downside_dev * periods_per_year.sqrt()
}

/// Maximum drawdown as a negative fraction of peak equity (0.0 if none).
pub fn max_drawdown(equity_curve: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst: f64 = 0.0;
    for &eq in equity_curve {
        peak = peak.max(eq);
        if peak > 0.0 {
            worst = worst.min((eq - peak) / peak);
        }
    }
    worst
}

/// Fraction of trades with positive net PnL.
pub fn win_rate(trades: &[ClosedTrade]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    trades.iter().filter(|t| t.is_winner()).count() as f64 / trades.len() as f64
}

/// Gross profit / gross loss, capped at 100 when there are no losses.
pub fn profit_factor(trades: &[ClosedTrade]) -> f64 {
    let profit: f64 = trades.iter().map(|t| t.net_pnl).filter(|p| *p > 0.0).sum();
    let loss: f64 = trades.iter().map(|t| t.net_pnl).filter(|p| *p < 0.0).map(f64::abs).sum();
    if loss < 1e-15 {
        return if profit > 0.0 { PROFIT_FACTOR_CAP } else { 0.0 };
    }
    (profit / loss).min(PROFIT_FACTOR_CAP)
}

/// Mean net PnL of winning trades (0.0 if none).
pub fn avg_win(trades: &[ClosedTrade]) -> f64 {
    let wins: Vec<f64> = trades.iter().filter(|t| t.is_winner()).map(|t| t.net_pnl).collect();
    mean_f64(&wins)
}

/// Mean net PnL of losing trades, negative (0.0 if none).
pub fn avg_loss(trades: &[ClosedTrade]) -> f64 {
    let losses: Vec<f64> = trades.iter().filter(|t| t.net_pnl < 0.0).map(|t| t.net_pnl).collect();
    mean_f64(&losses)
}

/// Expected net PnL per trade.
pub fn expectancy(trades: &[ClosedTrade]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    total_pnl(trades) / trades.len() as f64
}

/// Longest run of consecutive winning trades.
pub fn max_consecutive_wins(trades: &[ClosedTrade]) -> usize {
    longest_run(trades, |t| t.is_winner())
}

/// Longest run of consecutive non-winning trades.
pub fn max_consecutive_losses(trades: &[ClosedTrade]) -> usize {
    longest_run(trades, |t| !t.is_winner())
}

pub fn avg_candles_held(trades: &[ClosedTrade]) -> f64 {
    let held: Vec<f64> = trades.iter().map(|t| t.candles_held as f64).collect();
    mean_f64(&held)
}

// ─── Helpers ────────────────────────────────────────────────────────

fn longest_run(trades: &[ClosedTrade], pred: impl Fn(&ClosedTrade) -> bool) -> usize {
    let mut best = 0;
    let mut current = 0;
    for t in trades {
        if pred(t) {
            current += 1;
            best = best.max(current);
        } else {
            current = 0;
        }
    }
    best
}

/// Simple returns between consecutive equity points; skips non-positive bases.
pub fn period_returns(equity_curve: &[f64]) -> Vec<f64> {
    equity_curve
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

fn mean_f64(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample standard deviation.
fn std_dev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean_f64(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use signalfuse_core::domain::{ExitReason, Side};

    fn make_trade(net_pnl: f64) -> ClosedTrade {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ClosedTrade {
            instrument: "BTCUSDT".into(),
            side: Side::Long,
            entry_time: t,
            exit_time: t + chrono::Duration::minutes(20),
            entry_price: 100.0,
            exit_price: 100.0 + net_pnl / 10.0,
            size: 10.0,
            gross_pnl: net_pnl,
            fees: 0.0,
            net_pnl,
            return_pct: net_pnl / 1_000.0,
            exit_reason: if net_pnl > 0.0 { ExitReason::TakeProfit } else { ExitReason::StopLoss },
            candles_held: 4,
            margin_capped: false,
        }
    }

    // ── Return and PnL ──

    #[test]
    fn total_return_and_pnl() {
        assert!((total_return(&[10_000.0, 10_500.0]) - 0.05).abs() < 1e-12);
        assert_eq!(total_return(&[10_000.0]), 0.0);
        assert_eq!(total_return(&[]), 0.0);
        let trades = vec![make_trade(120.0), make_trade(-20.0)];
        assert!((total_pnl(&trades) - 100.0).abs() < 1e-12);
        assert!((expectancy(&trades) - 50.0).abs() < 1e-12);
    }

    // ── Sharpe / Sortino ──

    #[test]
    fn sharpe_positive_for_noisy_uptrend() {
        let mut eq = vec![10_000.0];
        for i in 1..200 {
            let r = if i % 2 == 0 { 1.002 } else { 0.9995 };
            eq.push(eq[i - 1] * r);
        }
        let s = sharpe_ratio(&eq, 105_120.0);
        assert!(s > 0.0 && s.is_finite(), "Sharpe should be positive, got {s}");
    }

    #[test]
    fn sharpe_constant_equity_is_zero() {
        assert_eq!(sharpe_ratio(&[10_000.0; 50], 105_120.0), 0.0);
        assert_eq!(sharpe_ratio(&[10_000.0], 105_120.0), 0.0);
    }

    #[test]
    fn sortino_no_downside_is_zero() {
        let eq: Vec<f64> = (0..100).map(|i| 10_000.0 + i as f64).collect();
        assert_eq!(sortino_ratio(&eq, 105_120.0), 0.0);
    }

    // ── Max drawdown ──

    #[test]
    fn max_drawdown_known() {
        let eq = vec![100_000.0, 110_000.0, 90_000.0, 95_000.0];
        let expected = (90_000.0 - 110_000.0) / 110_000.0;
        assert!((max_drawdown(&eq) - expected).abs() < 1e-10);
    }

    #[test]
    fn max_drawdown_monotonic_and_empty() {
        let eq: Vec<f64> = (0..100).map(|i| 100_000.0 + i as f64 * 100.0).collect();
        assert_eq!(max_drawdown(&eq), 0.0);
        assert_eq!(max_drawdown(&[]), 0.0);
    }

    #[test]
    fn max_drawdown_to_zero_is_minus_one() {
        assert!((max_drawdown(&[10_000.0, 5_000.0, 0.0]) + 1.0).abs() < 1e-12);
    }

    // ── Win rate / profit factor ──

    #[test]
    fn win_rate_mixed() {
        let trades = vec![make_trade(500.0), make_trade(-200.0), make_trade(300.0), make_trade(-100.0)];
        assert!((win_rate(&trades) - 0.5).abs() < 1e-10);
        assert_eq!(win_rate(&[]), 0.0);
    }

    #[test]
    fn profit_factor_mixed_and_capped() {
        let trades = vec![make_trade(500.0), make_trade(-200.0), make_trade(300.0)];
        assert!((profit_factor(&trades) - 4.0).abs() < 1e-10);
        assert_eq!(profit_factor(&[make_trade(10.0)]), 100.0);
        assert_eq!(profit_factor(&[make_trade(-10.0)]), 0.0);
        assert_eq!(profit_factor(&[]), 0.0);
    }

    #[test]
    fn avg_win_and_loss() {
        let trades = vec![make_trade(300.0), make_trade(-100.0), make_trade(100.0), make_trade(-300.0)];
        assert!((avg_win(&trades) - 200.0).abs() < 1e-10);
        assert!((avg_loss(&trades) + 200.0).abs() < 1e-10);
    }

    // ── Streaks ──

    #[test]
    fn consecutive_runs() {
        let trades = vec![
            make_trade(100.0),  // W
            make_trade(200.0),  // W
            make_trade(-100.0), // L
            make_trade(-200.0), // L
            make_trade(-300.0), // L
            make_trade(200.0),  // W
        ];
        assert_eq!(max_consecutive_wins(&trades), 2);
        assert_eq!(max_consecutive_losses(&trades), 3);
        assert_eq!(max_consecutive_wins(&[]), 0);
    }

    // ── Aggregate ──

    #[test]
    fn compute_no_trades_is_all_finite_zeroes() {
        let m = PerformanceMetrics::compute(&[10_000.0; 20], &[], 105_120.0);
        assert_eq!(m.trade_count, 0);
        assert_eq!(m.total_return, 0.0);
        assert_eq!(m.win_rate, 0.0);
        assert_eq!(m.avg_candles_held, 0.0);
        assert!(m.sharpe.is_finite() && m.sortino.is_finite());
    }

    #[test]
    fn compute_with_trades() {
        let eq = vec![10_000.0, 10_050.0, 10_020.0, 10_120.0];
        let trades = vec![make_trade(50.0), make_trade(-30.0), make_trade(100.0)];
        let m = PerformanceMetrics::compute(&eq, &trades, 105_120.0);
        assert_eq!(m.trade_count, 3);
        assert!((m.total_pnl - 120.0).abs() < 1e-10);
        assert!((m.win_rate - 2.0 / 3.0).abs() < 1e-10);
        assert!(m.max_drawdown < 0.0);
        assert_eq!(m.avg_candles_held, 4.0);
    }

    #[test]
    fn period_returns_basic() {
        let r = period_returns(&[100.0, 110.0, 105.0]);
        assert_eq!(r.len(), 2);
        assert!((r[0] - 0.1).abs() < 1e-10);
        assert!((r[1] - (105.0 - 110.0) / 110.0).abs() < 1e-10);
    }
}
