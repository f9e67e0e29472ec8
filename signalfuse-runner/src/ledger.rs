//! Single-writer capital ledger for the live loop.
//!
//! One thread owns the `AccountState`; instrument workers send it requests
//! over a channel and wait for the reply, so debits and credits from
//! concurrently closing positions are applied one at a time.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use signalfuse_core::domain::{AccountState, CapitalLedger, ClosedTrade, LedgerError, Reservation, Settlement};

use crate::error::RunError;

enum Request {
    Capital {
        reply: Sender<f64>,
    },
    Reserve {
        instrument: String,
        notional: f64,
        reply: Sender<Reservation>,
    },
    Settle {
        trade: Box<ClosedTrade>,
        reply: Sender<Settlement>,
    },
    Snapshot {
        reply: Sender<AccountState>,
    },
    Stop,
}

/// Cloneable client side of the ledger. Every call blocks until the ledger replies.
#[derive(Debug, Clone)]
pub struct LedgerHandle {
    tx: Sender<Request>,
}

impl LedgerHandle {
    fn call<T>(&self, make: impl FnOnce(Sender<T>) -> Request) -> Result<T, LedgerError> {
        let (reply, rx) = mpsc::channel();
        self.tx.send(make(reply)).map_err(|_| LedgerError::Unavailable)?;
        rx.recv().map_err(|_| LedgerError::Unavailable)
    }

    /// Copy of the account as it stands now.
    pub fn snapshot(&self) -> Result<AccountState, LedgerError> {
        self.call(|reply| Request::Snapshot { reply })
    }
}

impl CapitalLedger for LedgerHandle {
    fn capital(&mut self) -> Result<f64, LedgerError> {
        self.call(|reply| Request::Capital { reply })
    }

    fn reserve(&mut self, instrument: &str, notional: f64) -> Result<Reservation, LedgerError> {
        self.call(|reply| Request::Reserve {
            instrument: instrument.to_string(),
            notional,
            reply,
        })
    }

    fn settle(&mut self, trade: &ClosedTrade) -> Result<Settlement, LedgerError> {
        self.call(|reply| Request::Settle {
            trade: Box::new(trade.clone()),
            reply,
        })
    }
}

/// The running ledger thread.
#[derive(Debug)]
pub struct LedgerService {
    handle: LedgerHandle,
    thread: JoinHandle<AccountState>,
}

impl LedgerService {
    pub fn spawn(account: AccountState) -> Result<Self, RunError> {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("capital-ledger".into())
            .spawn(move || serve(account, rx))
            .map_err(|e| RunError::Live(format!("failed to spawn ledger thread: {e}")))?;
        Ok(Self {
            handle: LedgerHandle { tx },
            thread,
        })
    }

    pub fn handle(&self) -> LedgerHandle {
        self.handle.clone()
    }

    /// Stop the ledger and return the final account. Outstanding handles get
    /// `LedgerError::Unavailable` from then on.
    pub fn shutdown(self) -> Result<AccountState, RunError> {
        let _ = self.handle.tx.send(Request::Stop);
        self.thread
            .join()
            .map_err(|_| RunError::Live("ledger thread panicked".into()))
    }
}

fn serve(mut account: AccountState, rx: Receiver<Request>) -> AccountState {
    while let Ok(request) = rx.recv() {
        // A dropped reply sender means the caller gave up; the mutation still stands.
        match request {
            Request::Capital { reply } => {
                let _ = reply.send(account.capital());
            }
            Request::Reserve {
                instrument,
                notional,
                reply,
            } => {
                let outcome = account.reserve(&instrument, notional);
                debug!(instrument = %instrument, notional, ?outcome, "reserve");
                let _ = reply.send(outcome);
            }
            Request::Settle { trade, reply } => {
                let settlement = account.settle(&trade);
                debug!(
                    instrument = %trade.instrument,
                    applied_pnl = settlement.applied_pnl,
                    capital = settlement.capital_after,
                    "settle"
                );
                let _ = reply.send(settlement);
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(account.clone());
            }
            Request::Stop => break,
        }
    }
    info!(
        capital = account.capital(),
        realized_pnl = account.realized_pnl(),
        margin_violations = account.margin_violations().len(),
        "capital ledger stopped"
    );
    account
}
