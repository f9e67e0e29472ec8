//! Risk and position sizing for one instrument.
//!
//! State machine: `None → Open → (Trailing) → Closed`.
//!
//! - Entry size is a bounded Kelly fraction of capital:
//!   `f = clamp(2 * confidence - 1, 0, max_fraction)`,
//!   `notional = capital * f * risk_per_trade_multiplier`.
//! - Stop-loss and take-profit are fixed fractions of the entry price.
//! - Once the favorable move reaches the activation margin the stop trails the
//!   close by a fixed offset, through a ratchet that never loosens it.
//! - Portfolio limits (concurrent positions, drawdown halt) travel with the
//!   config as `EntryLimits` and are enforced by the capital ledger.
//! - Exits are evaluated against the candle's range. If a candle touches both
//!   levels the stop is assumed to fill first; a candle that opens beyond a
//!   level fills at its open.

pub mod ratchet;

pub use ratchet::RatchetState;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::domain::{Candle, ClosedTrade, EntryLimits, ExitReason, Position, PositionState, Side};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    /// Favorable move (fraction of entry) at which the stop starts trailing.
    pub trailing_activation_pct: f64,
    /// Distance between the trailing stop and the close, as a fraction of the close.
    pub trailing_offset_pct: f64,
    /// Hard ceiling on the Kelly fraction.
    pub max_fraction: f64,
    pub risk_per_trade_multiplier: f64,
    /// Fee charged on each side of a trade, as a fraction of traded notional.
    pub fee_rate: f64,
    pub max_open_positions: usize,
    /// Stop opening positions once capital is this far below initial capital.
    pub halt_drawdown_pct: f64,
    /// Losing trades in a row that halt entries when the drawdown also
    /// exceeds `halt_streak_drawdown_pct`. 0 disables the rule.
    pub halt_losing_streak: u32,
    pub halt_streak_drawdown_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: 0.02,
            take_profit_pct: 0.05,
            trailing_activation_pct: 0.02,
            trailing_offset_pct: 0.01,
            max_fraction: 0.25,
            risk_per_trade_multiplier: 1.0,
            fee_rate: 0.001,
            max_open_positions: 5,
            halt_drawdown_pct: 0.05,
            halt_losing_streak: 3,
            halt_streak_drawdown_pct: 0.02,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, f64, bool, &'static str); 7] = [
            ("risk.stop_loss_pct", self.stop_loss_pct, in_open_unit(self.stop_loss_pct), "(0, 1)"),
            ("risk.take_profit_pct", self.take_profit_pct, self.take_profit_pct > 0.0 && self.take_profit_pct.is_finite(), "> 0"),
            ("risk.trailing_activation_pct", self.trailing_activation_pct, self.trailing_activation_pct >= 0.0 && self.trailing_activation_pct.is_finite(), ">= 0"),
            ("risk.trailing_offset_pct", self.trailing_offset_pct, in_open_unit(self.trailing_offset_pct), "(0, 1)"),
            ("risk.max_fraction", self.max_fraction, self.max_fraction > 0.0 && self.max_fraction <= 1.0, "(0, 1]"),
            ("risk.risk_per_trade_multiplier", self.risk_per_trade_multiplier, self.risk_per_trade_multiplier > 0.0 && self.risk_per_trade_multiplier.is_finite(), "> 0"),
            ("risk.fee_rate", self.fee_rate, (0.0..0.1).contains(&self.fee_rate), "[0, 0.1)"),
        ];
        for (field, value, ok, expected) in checks {
            if !ok {
                return Err(ConfigError::OutOfRange {
                    field,
                    value,
                    expected,
                });
            }
        }
        if self.max_open_positions == 0 {
            return Err(ConfigError::OutOfRange {
                field: "risk.max_open_positions",
                value: 0.0,
                expected: ">= 1",
            });
        }
        if !(self.halt_drawdown_pct > 0.0 && self.halt_drawdown_pct <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "risk.halt_drawdown_pct",
                value: self.halt_drawdown_pct,
                expected: "(0, 1]",
            });
        }
        if !(0.0..=1.0).contains(&self.halt_streak_drawdown_pct) {
            return Err(ConfigError::OutOfRange {
                field: "risk.halt_streak_drawdown_pct",
                value: self.halt_streak_drawdown_pct,
                expected: "[0, 1]",
            });
        }
        Ok(())
    }

    /// Ledger-side limits for an account running under this config.
    pub fn entry_limits(&self) -> EntryLimits {
        EntryLimits {
            max_open_positions: self.max_open_positions,
            halt_drawdown_pct: self.halt_drawdown_pct,
            halt_losing_streak: self.halt_losing_streak,
            halt_streak_drawdown_pct: self.halt_streak_drawdown_pct,
        }
    }
}

fn in_open_unit(x: f64) -> bool {
    x > 0.0 && x < 1.0
}

/// Bounded Kelly fraction for a directional confidence.
pub fn kelly_fraction(confidence: f64, max_fraction: f64) -> f64 {
    if confidence.is_nan() {
        return 0.0;
    }
    (confidence * 2.0 - 1.0).clamp(0.0, max_fraction)
}

/// A sized entry, not yet booked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryPlan {
    pub side: Side,
    pub fraction: f64,
    pub notional: f64,
    pub size: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Result of a trailing-stop update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrailingUpdate {
    Unchanged,
    Moved { from: f64, to: f64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskError {
    #[error("position already open for {instrument}")]
    PositionAlreadyOpen { instrument: String },
}

/// Position state machine for one instrument.
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
    state: PositionState,
    position: Option<Position>,
    ratchet: Option<RatchetState>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            state: PositionState::None,
            position: None,
            ratchet: None,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn state(&self) -> PositionState {
        self.state
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.position.as_ref().map_or(0.0, |p| p.unrealized_pnl(price))
    }

    /// Size an entry at `price` from the fused confidence and current capital.
    pub fn plan_entry(&self, side: Side, confidence: f64, capital: f64, price: f64) -> EntryPlan {
        let fraction = kelly_fraction(confidence, self.config.max_fraction);
        let notional = capital.max(0.0) * fraction * self.config.risk_per_trade_multiplier;
        let size = if price > 0.0 { notional / price } else { 0.0 };
        let (stop_loss, take_profit) = match side {
            Side::Long => (
                price * (1.0 - self.config.stop_loss_pct),
                price * (1.0 + self.config.take_profit_pct),
            ),
            Side::Short => (
                price * (1.0 + self.config.stop_loss_pct),
                price * (1.0 - self.config.take_profit_pct),
            ),
        };
        EntryPlan {
            side,
            fraction,
            notional,
            size,
            entry_price: price,
            stop_loss,
            take_profit,
        }
    }

    /// `None/Closed → Open`.
    pub fn open(
        &mut self,
        instrument: &str,
        plan: &EntryPlan,
        at: DateTime<Utc>,
    ) -> Result<&Position, RiskError> {
        if self.state.is_active() {
            return Err(RiskError::PositionAlreadyOpen {
                instrument: instrument.to_string(),
            });
        }
        self.ratchet = Some(RatchetState::with_initial_level(plan.side, plan.stop_loss));
        self.state = PositionState::Open;
        Ok(self.position.insert(Position {
            instrument: instrument.to_string(),
            side: plan.side,
            state: PositionState::Open,
            entry_price: plan.entry_price,
            size: plan.size,
            notional: plan.notional,
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit,
            trailing_stop_anchor: None,
            opened_at: at,
            candles_held: 0,
        }))
    }

    /// Age the open position by one candle and report a stop/target hit.
    pub fn on_candle(&mut self, candle: &Candle) -> Option<(ExitReason, f64)> {
        let pos = self.position.as_mut()?;
        pos.candles_held += 1;
        exit_for(pos, candle)
    }

    /// Trail the stop from the candle's close. Only called when no exit fired.
    pub fn update_trailing(&mut self, close: f64) -> TrailingUpdate {
        let (Some(pos), Some(ratchet)) = (self.position.as_mut(), self.ratchet.as_mut()) else {
            return TrailingUpdate::Unchanged;
        };

        if pos.state == PositionState::Open
            && pos.favorable_move(close) >= self.config.trailing_activation_pct
        {
            pos.state = PositionState::Trailing;
            self.state = PositionState::Trailing;
        }
        if pos.state != PositionState::Trailing {
            return TrailingUpdate::Unchanged;
        }

        let anchor = match (pos.side, pos.trailing_stop_anchor) {
            (Side::Long, Some(a)) => a.max(close),
            (Side::Short, Some(a)) => a.min(close),
            (_, None) => close,
        };
        pos.trailing_stop_anchor = Some(anchor);

        let proposed = match pos.side {
            Side::Long => anchor * (1.0 - self.config.trailing_offset_pct),
            Side::Short => anchor * (1.0 + self.config.trailing_offset_pct),
        };
        let from = pos.stop_loss;
        let to = ratchet.apply(proposed);
        if to == from {
            return TrailingUpdate::Unchanged;
        }
        pos.stop_loss = to;
        TrailingUpdate::Moved { from, to }
    }

    /// `Open/Trailing → Closed` at `price`. Fees are charged on both sides.
    pub fn close(&mut self, price: f64, reason: ExitReason, at: DateTime<Utc>) -> Option<ClosedTrade> {
        let pos = self.position.take()?;
        self.ratchet = None;
        self.state = PositionState::Closed;

        let gross_pnl = pos.side.sign() * pos.size * (price - pos.entry_price);
        let fees = self.config.fee_rate * pos.size * (pos.entry_price + price);
        let net_pnl = gross_pnl - fees;
        let return_pct = if pos.notional > 0.0 {
            net_pnl / pos.notional
        } else {
            0.0
        };

        Some(ClosedTrade {
            instrument: pos.instrument,
            side: pos.side,
            entry_time: pos.opened_at,
            exit_time: at,
            entry_price: pos.entry_price,
            exit_price: price,
            size: pos.size,
            gross_pnl,
            fees,
            net_pnl,
            return_pct,
            exit_reason: reason,
            candles_held: pos.candles_held,
            margin_capped: false,
        })
    }
}

fn exit_for(pos: &Position, candle: &Candle) -> Option<(ExitReason, f64)> {
    let stop_reason = if pos.state == PositionState::Trailing {
        ExitReason::TrailingStop
    } else {
        ExitReason::StopLoss
    };
    let (sl, tp) = (pos.stop_loss, pos.take_profit);

    match pos.side {
        Side::Long => {
            if candle.open <= sl {
                Some((stop_reason, candle.open))
            } else if candle.low <= sl {
                Some((stop_reason, sl))
            } else if candle.open >= tp {
                Some((ExitReason::TakeProfit, candle.open))
            } else if candle.high >= tp {
                Some((ExitReason::TakeProfit, tp))
            } else {
                None
            }
        }
        Side::Short => {
            if candle.open >= sl {
                Some((stop_reason, candle.open))
            } else if candle.high >= sl {
                Some((stop_reason, sl))
            } else if candle.open <= tp {
                Some((ExitReason::TakeProfit, candle.open))
            } else if candle.low <= tp {
                Some((ExitReason::TakeProfit, tp))
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Timeframe;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            instrument: "BTCUSDT".into(),
            timeframe: Timeframe::M5,
            open_time: t0(),
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    fn opened(side: Side) -> RiskManager {
        let mut rm = RiskManager::new(RiskConfig::default());
        let plan = rm.plan_entry(side, 0.9, 10_000.0, 100.0);
        rm.open("BTCUSDT", &plan, t0()).unwrap();
        rm
    }

    #[test]
    fn kelly_is_bounded() {
        assert_eq!(kelly_fraction(0.5, 0.25), 0.0);
        assert_eq!(kelly_fraction(0.4, 0.25), 0.0);
        assert!((kelly_fraction(0.6, 0.25) - 0.2).abs() < 1e-12);
        assert_eq!(kelly_fraction(0.95, 0.25), 0.25);
        assert_eq!(kelly_fraction(f64::NAN, 0.25), 0.0);
    }

    #[test]
    fn entry_plan_uses_capital_fraction_and_levels() {
        let rm = RiskManager::new(RiskConfig::default());
        let plan = rm.plan_entry(Side::Long, 0.9, 10_000.0, 100.0);
        assert_eq!(plan.fraction, 0.25);
        assert!((plan.notional - 2_500.0).abs() < 1e-9);
        assert!((plan.size - 25.0).abs() < 1e-9);
        assert!((plan.stop_loss - 98.0).abs() < 1e-9);
        assert!((plan.take_profit - 105.0).abs() < 1e-9);

        let short = rm.plan_entry(Side::Short, 0.9, 10_000.0, 100.0);
        assert!((short.stop_loss - 102.0).abs() < 1e-9);
        assert!((short.take_profit - 95.0).abs() < 1e-9);
    }

    #[test]
    fn cannot_open_twice() {
        let mut rm = opened(Side::Long);
        let plan = rm.plan_entry(Side::Long, 0.9, 10_000.0, 100.0);
        assert!(matches!(
            rm.open("BTCUSDT", &plan, t0()),
            Err(RiskError::PositionAlreadyOpen { .. })
        ));
    }

    #[test]
    fn long_stop_fills_at_level_or_gap_open() {
        let mut rm = opened(Side::Long);
        assert_eq!(
            rm.on_candle(&candle(99.0, 99.5, 97.5, 98.5)),
            Some((ExitReason::StopLoss, 98.0))
        );
        let mut rm = opened(Side::Long);
        assert_eq!(
            rm.on_candle(&candle(96.0, 97.0, 95.0, 96.5)),
            Some((ExitReason::StopLoss, 96.0))
        );
    }

    #[test]
    fn stop_wins_when_both_levels_touched() {
        let mut rm = opened(Side::Long);
        assert_eq!(
            rm.on_candle(&candle(100.0, 106.0, 97.0, 104.0)),
            Some((ExitReason::StopLoss, 98.0))
        );
    }

    #[test]
    fn short_take_profit() {
        let mut rm = opened(Side::Short);
        assert_eq!(
            rm.on_candle(&candle(97.0, 97.5, 94.0, 94.5)),
            Some((ExitReason::TakeProfit, 95.0))
        );
    }

    #[test]
    fn trailing_activates_and_ratchets() {
        let mut rm = opened(Side::Long);
        assert_eq!(rm.update_trailing(101.0), TrailingUpdate::Unchanged);
        assert_eq!(rm.state(), PositionState::Open);

        // +3%: activates, stop = 103 * 0.99 = 101.97
        match rm.update_trailing(103.0) {
            TrailingUpdate::Moved { from, to } => {
                assert!((from - 98.0).abs() < 1e-9);
                assert!((to - 101.97).abs() < 1e-9);
            }
            other => panic!("expected a move, got {other:?}"),
        }
        assert_eq!(rm.state(), PositionState::Trailing);

        // Pullback never loosens
        assert_eq!(rm.update_trailing(102.0), TrailingUpdate::Unchanged);
        assert!((rm.position().unwrap().stop_loss - 101.97).abs() < 1e-9);

        // Trailing stop hit reports its own reason
        assert_eq!(
            rm.on_candle(&candle(102.0, 102.5, 101.5, 101.8)),
            Some((ExitReason::TrailingStop, 101.97))
        );
    }

    #[test]
    fn close_books_fees_and_resets_slot() {
        let mut rm = opened(Side::Long);
        let trade = rm.close(105.0, ExitReason::TakeProfit, t0()).unwrap();
        // 25 units: gross 125, fees 0.001 * 25 * 205 = 5.125
        assert!((trade.gross_pnl - 125.0).abs() < 1e-9);
        assert!((trade.fees - 5.125).abs() < 1e-9);
        assert!((trade.net_pnl - 119.875).abs() < 1e-9);
        assert!(trade.is_winner());
        assert_eq!(rm.state(), PositionState::Closed);
        assert!(rm.position().is_none());
        assert!(rm.close(105.0, ExitReason::TakeProfit, t0()).is_none());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = RiskConfig {
            max_fraction: 1.5,
            ..RiskConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "risk.max_fraction", .. })
        ));
        assert!(RiskConfig::default().validate().is_ok());

        let cfg = RiskConfig {
            max_open_positions: 0,
            ..RiskConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "risk.max_open_positions", .. })
        ));
    }

    #[test]
    fn entry_limits_follow_config() {
        let cfg = RiskConfig {
            max_open_positions: 2,
            halt_drawdown_pct: 0.1,
            ..RiskConfig::default()
        };
        let limits = cfg.entry_limits();
        assert_eq!(limits.max_open_positions, 2);
        assert_eq!(limits.halt_drawdown_pct, 0.1);
        assert_eq!(limits.halt_losing_streak, 3);
    }
}
