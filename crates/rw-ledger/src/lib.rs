//! # rw-ledger
//!
//! Durable storage for terminal trials. Every record is written atomically
//! and keyed by trial id, so re-recording a trial is harmless and a crash
//! mid-write never exposes a half-written record.

pub mod json;
pub mod memory;
pub mod summary;

pub use json::{JsonLedger, StudyMeta};
pub use memory::MemoryLedger;
pub use summary::BestTrialSummary;

use rw_types::{best_of, Direction, LedgerError, Trial};

/// Storage for terminal trials.
pub trait MetricsLedger: Send {
    /// Store a terminal trial. Recording the same trial twice keeps one
    /// record.
    fn record(&mut self, trial: &Trial) -> Result<(), LedgerError>;

    /// All stored trials in id order.
    fn trials(&self) -> Vec<Trial>;

    fn direction(&self) -> Direction;

    /// Best Completed trial, recomputed from the stored records.
    fn best(&self) -> Option<Trial> {
        let trials = self.trials();
        best_of(&trials, self.direction()).cloned()
    }

    /// Persist the end-of-study summary. Ledgers without durable storage
    /// ignore it.
    fn write_summary(&mut self, _summary: &BestTrialSummary) -> Result<(), LedgerError> {
        Ok(())
    }
}

pub(crate) fn ensure_terminal(trial: &Trial) -> Result<(), LedgerError> {
    if trial.status.is_terminal() {
        Ok(())
    } else {
        Err(LedgerError::NotTerminal {
            trial_id: trial.id,
            status: trial.status,
        })
    }
}
