//! Domain types: candles, positions, closed trades, account capital.

pub mod account;
pub mod candle;
pub mod position;

pub use account::{
    AccountState, CapitalLedger, EntryLimits, LedgerError, MarginViolation, Reservation,
    Settlement,
};
pub use candle::{Candle, CandleRef, Timeframe};
pub use position::{ClosedTrade, ExitReason, Position, PositionState, Side};
