use std::collections::BTreeMap;

use rw_types::{Direction, LedgerError, Trial, TrialId};

use crate::summary::BestTrialSummary;
use crate::{ensure_terminal, MetricsLedger};

/// In-memory ledger for tests and dry runs.
#[derive(Debug, Clone)]
pub struct MemoryLedger {
    direction: Direction,
    records: BTreeMap<TrialId, Trial>,
    summary: Option<BestTrialSummary>,
}

impl MemoryLedger {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            records: BTreeMap::new(),
            summary: None,
        }
    }

    pub fn summary(&self) -> Option<&BestTrialSummary> {
        self.summary.as_ref()
    }
}

impl MetricsLedger for MemoryLedger {
    fn record(&mut self, trial: &Trial) -> Result<(), LedgerError> {
        ensure_terminal(trial)?;
        self.records.insert(trial.id, trial.clone());
        Ok(())
    }

    fn trials(&self) -> Vec<Trial> {
        self.records.values().cloned().collect()
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn write_summary(&mut self, summary: &BestTrialSummary) -> Result<(), LedgerError> {
        self.summary = Some(summary.clone());
        Ok(())
    }
}
