//! Position and closed-trade types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for long, -1.0 for short.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Side implied by the sign of a score; `None` for zero or NaN.
    pub fn from_score(score: f64) -> Option<Side> {
        if score > 0.0 {
            Some(Side::Long)
        } else if score < 0.0 {
            Some(Side::Short)
        } else {
            None
        }
    }
}

/// Lifecycle of the position slot of one instrument.
///
/// `None → Open → (Trailing) → Closed`; a closed slot may open again on a later candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    None,
    Open,
    Trailing,
    Closed,
}

impl PositionState {
    pub fn is_active(&self) -> bool {
        matches!(self, PositionState::Open | PositionState::Trailing)
    }
}

/// An open position. At most one exists per instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    pub side: Side,
    pub state: PositionState,
    pub entry_price: f64,
    /// Units of the instrument held.
    pub size: f64,
    /// Capital reserved at entry (entry_price * size).
    pub notional: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Most favorable close seen since trailing activated.
    pub trailing_stop_anchor: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub candles_held: usize,
}

impl Position {
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.side.sign() * self.size * (price - self.entry_price)
    }

    /// Unrealized move as a fraction of entry, positive when in profit.
    pub fn favorable_move(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / self.entry_price
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    OpposingSignal,
    EndOfData,
    Shutdown,
}

/// A closed position with its realized outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub instrument: String,
    pub side: Side,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub gross_pnl: f64,
    pub fees: f64,
    /// Realized PnL after fees and after any margin cap.
    pub net_pnl: f64,
    pub return_pct: f64,
    pub exit_reason: ExitReason,
    pub candles_held: usize,
    /// True if the realized loss was capped at available capital.
    pub margin_capped: bool,
}

impl ClosedTrade {
    pub fn is_winner(&self) -> bool {
        self.net_pnl > 0.0
    }
}
