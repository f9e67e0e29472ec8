//! Account capital and the ledger seam through which it is mutated.
//!
//! Backtests own an `AccountState` directly. Live loops share one `AccountState`
//! behind a single-writer ledger and talk to it through the same `CapitalLedger`
//! trait, so the orchestrator never touches capital directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use super::position::ClosedTrade;

/// A realized loss that exceeded available capital and was capped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginViolation {
    pub instrument: String,
    pub at: DateTime<Utc>,
    /// Loss the trade would have realized.
    pub requested_loss: f64,
    /// Loss actually booked (equal to capital before settlement).
    pub capped_loss: f64,
}

/// Portfolio-wide rules checked on every reservation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntryLimits {
    /// Concurrent open positions across all instruments.
    pub max_open_positions: usize,
    /// Drawdown from initial capital at which new entries stop.
    pub halt_drawdown_pct: f64,
    /// Consecutive losing trades that, together with `halt_streak_drawdown_pct`,
    /// stop new entries. 0 disables the rule.
    pub halt_losing_streak: u32,
    pub halt_streak_drawdown_pct: f64,
}

impl Default for EntryLimits {
    fn default() -> Self {
        Self {
            max_open_positions: 5,
            halt_drawdown_pct: 0.05,
            halt_losing_streak: 3,
            halt_streak_drawdown_pct: 0.02,
        }
    }
}

/// Outcome of asking the ledger to reserve capital for an entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reservation {
    Granted,
    Denied { available: f64 },
    /// Trading is halted; `drawdown` is the loss from initial capital as a fraction.
    Halted { drawdown: f64 },
    PositionLimit { open: usize },
}

/// Outcome of settling a closed trade against capital.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    /// PnL actually applied to capital.
    pub applied_pnl: f64,
    pub capital_after: f64,
    pub violation: Option<MarginViolation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("capital ledger is no longer running")]
    Unavailable,
}

/// Serialized access to shared capital.
pub trait CapitalLedger {
    /// Total capital (realized), used for sizing.
    fn capital(&mut self) -> Result<f64, LedgerError>;

    /// Reserve `notional` for a new position on `instrument`.
    fn reserve(&mut self, instrument: &str, notional: f64) -> Result<Reservation, LedgerError>;

    /// Release the instrument's reservation and book the trade's PnL.
    fn settle(&mut self, trade: &ClosedTrade) -> Result<Settlement, LedgerError>;
}

/// The single mutable capital record of a run.
///
/// Invariant: `capital >= 0` after every operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    initial_capital: f64,
    capital: f64,
    realized_pnl: f64,
    /// Notional reserved by each open position.
    reserved: BTreeMap<String, f64>,
    margin_violations: Vec<MarginViolation>,
    /// Consecutive losing settlements, reset by any non-losing one.
    losing_streak: u32,
    limits: EntryLimits,
}

impl AccountState {
    pub fn new(initial_capital: f64) -> Self {
        let capital = initial_capital.max(0.0);
        Self {
            initial_capital: capital,
            capital,
            realized_pnl: 0.0,
            reserved: BTreeMap::new(),
            margin_violations: Vec::new(),
            losing_streak: 0,
            limits: EntryLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: EntryLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &EntryLimits {
        &self.limits
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn capital(&self) -> f64 {
        self.capital
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    /// Capital not tied up in open positions.
    pub fn available(&self) -> f64 {
        (self.capital - self.reserved.values().sum::<f64>()).max(0.0)
    }

    pub fn open_positions(&self) -> usize {
        self.reserved.len()
    }

    pub fn margin_violations(&self) -> &[MarginViolation] {
        &self.margin_violations
    }

    pub fn losing_streak(&self) -> u32 {
        self.losing_streak
    }

    /// Realized loss from initial capital as a fraction; 0 when in profit.
    pub fn drawdown(&self) -> f64 {
        if self.initial_capital <= 0.0 {
            return 0.0;
        }
        ((self.initial_capital - self.capital) / self.initial_capital).max(0.0)
    }

    /// Whether the halt rules block new entries.
    pub fn is_halted(&self) -> bool {
        let drawdown = self.drawdown();
        let limits = &self.limits;
        drawdown >= limits.halt_drawdown_pct
            || (limits.halt_losing_streak > 0
                && self.losing_streak >= limits.halt_losing_streak
                && drawdown > limits.halt_streak_drawdown_pct)
    }

    /// Reserve `notional` for `instrument`. Halt rules are checked first, then
    /// the position cap, then available capital.
    pub fn reserve(&mut self, instrument: &str, notional: f64) -> Reservation {
        if self.is_halted() {
            return Reservation::Halted {
                drawdown: self.drawdown(),
            };
        }
        let open = self.open_positions();
        if open >= self.limits.max_open_positions && !self.reserved.contains_key(instrument) {
            return Reservation::PositionLimit { open };
        }
        let available = self.available();
        if notional.is_nan()
            || notional <= 0.0
            || notional > available
            || self.reserved.contains_key(instrument)
        {
            return Reservation::Denied { available };
        }
        self.reserved.insert(instrument.to_string(), notional);
        Reservation::Granted
    }

    /// Book a closed trade. A loss larger than capital is capped at capital and
    /// recorded as exactly one `MarginViolation`.
    pub fn settle(&mut self, trade: &ClosedTrade) -> Settlement {
        self.reserved.remove(&trade.instrument);

        let mut applied = trade.net_pnl;
        let mut violation = None;
        if -applied > self.capital {
            let v = MarginViolation {
                instrument: trade.instrument.clone(),
                at: trade.exit_time,
                requested_loss: -trade.net_pnl,
                capped_loss: self.capital,
            };
            applied = -self.capital;
            self.margin_violations.push(v.clone());
            violation = Some(v);
        }

        self.capital = (self.capital + applied).max(0.0);
        self.realized_pnl += applied;
        if applied < 0.0 {
            self.losing_streak += 1;
        } else {
            self.losing_streak = 0;
        }

        Settlement {
            applied_pnl: applied,
            capital_after: self.capital,
            violation,
        }
    }
}

impl CapitalLedger for AccountState {
    fn capital(&mut self) -> Result<f64, LedgerError> {
        Ok(AccountState::capital(self))
    }

    fn reserve(&mut self, instrument: &str, notional: f64) -> Result<Reservation, LedgerError> {
        Ok(AccountState::reserve(self, instrument, notional))
    }

    fn settle(&mut self, trade: &ClosedTrade) -> Result<Settlement, LedgerError> {
        Ok(AccountState::settle(self, trade))
    }
}
