//! The study loop: suggest, run, record, repeat.

use chrono::{DateTime, Utc};
use rw_ledger::{BestTrialSummary, JsonLedger, MetricsLedger};
use rw_types::{
    config_error, LedgerError, RwError, RwResult, SearchSpace, StudyRecord, Trial, TrialId,
    TrialStatus,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::StudyConfig;
use crate::pruner::Pruner;
use crate::resource::{ResourceProbe, ResourceSelector};
use crate::runner::{CancelFlag, TerminalState, Trainer, TrialRunner};
use crate::sampler::{history_from_trials, Sampler};

/// Outcome of one `optimize` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudySummary {
    /// Identifies this invocation; a resumed study gets a new one.
    pub session_id: Uuid,
    pub study: String,
    pub n_trials: usize,
    pub n_completed: usize,
    pub n_pruned: usize,
    pub n_failed: usize,
    /// Trials run by this invocation (the rest were loaded from the ledger).
    pub n_run: usize,
    pub best: Option<Trial>,
    pub cancelled: bool,
    /// Trial stopped by cancellation. It is not recorded, so a resumed study
    /// runs it again.
    pub interrupted: Option<TrialId>,
    /// Persistence problems that did not stop the study.
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Assembles a [`Study`]. Components that are not supplied are built from
/// the [`StudyConfig`].
pub struct StudyBuilder {
    config: StudyConfig,
    space: SearchSpace,
    sampler: Option<Box<dyn Sampler>>,
    pruner: Option<Box<dyn Pruner>>,
    ledger: Option<Box<dyn MetricsLedger>>,
    probe: Option<Box<dyn ResourceProbe>>,
    cancel: CancelFlag,
}

impl StudyBuilder {
    pub fn sampler(mut self, sampler: Box<dyn Sampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn pruner(mut self, pruner: Box<dyn Pruner>) -> Self {
        self.pruner = Some(pruner);
        self
    }

    pub fn ledger(mut self, ledger: Box<dyn MetricsLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn probe(mut self, probe: Box<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate the configuration, open the ledger and rebuild state from any
    /// trials it already holds.
    pub fn build(self) -> RwResult<Study> {
        let StudyBuilder {
            config,
            space,
            sampler,
            pruner,
            ledger,
            probe,
            cancel,
        } = self;

        config.validate()?;
        space.validate()?;
        let study_dir = config.study_dir()?;

        let ledger = match ledger {
            Some(ledger) => ledger,
            None => Box::new(
                JsonLedger::open(&study_dir, config.direction).map_err(|e| match e {
                    LedgerError::DirectionMismatch { .. } => {
                        config_error!("{}: {e}", study_dir.display())
                    }
                    other => RwError::from(other),
                })?,
            ),
        };
        if ledger.direction() != config.direction {
            return Err(config_error!(
                "ledger direction {} does not match study direction {}",
                ledger.direction(),
                config.direction
            ));
        }

        let pruner = pruner.unwrap_or_else(|| config.build_pruner());
        let mut record = StudyRecord::new(config.direction);
        for trial in ledger.trials() {
            match trial.status {
                TrialStatus::Completed | TrialStatus::Pruned => pruner.replay(&trial),
                _ => pruner.discard(trial.id),
            }
            record.upsert(trial);
        }
        let resumed = record.trials().len();

        // Offset the seed so a resumed study does not replay the startup draws
        // of the first run.
        let sampler = sampler.unwrap_or_else(|| {
            config
                .clone()
                .with_seed(config.seed.wrapping_add(record.next_id()))
                .build_sampler()
        });
        let probe = probe.unwrap_or_else(|| config.build_probe());

        let session_id = Uuid::new_v4();
        tracing::info!(
            study = %config.name,
            session = %session_id,
            dir = %study_dir.display(),
            resumed,
            n_trials = config.n_trials,
            sampler = sampler.name(),
            pruner = pruner.name(),
            direction = %config.direction,
            "study opened"
        );

        let runner = TrialRunner::new(&config.name, &study_dir, config.max_checkpoint, cancel.clone());
        let resources = ResourceSelector::new(probe, config.resource.clone());

        Ok(Study {
            session_id,
            config,
            space,
            record,
            sampler,
            pruner,
            ledger,
            resources,
            runner,
            cancel,
            warnings: Vec::new(),
        })
    }
}

pub struct Study {
    session_id: Uuid,
    config: StudyConfig,
    space: SearchSpace,
    record: StudyRecord,
    sampler: Box<dyn Sampler>,
    pruner: Box<dyn Pruner>,
    ledger: Box<dyn MetricsLedger>,
    resources: ResourceSelector,
    runner: TrialRunner,
    cancel: CancelFlag,
    warnings: Vec<String>,
}

impl Study {
    pub fn builder(config: StudyConfig, space: SearchSpace) -> StudyBuilder {
        StudyBuilder {
            config,
            space,
            sampler: None,
            pruner: None,
            ledger: None,
            probe: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn config(&self) -> &StudyConfig {
        &self.config
    }

    pub fn record(&self) -> &StudyRecord {
        &self.record
    }

    pub fn ledger(&self) -> &dyn MetricsLedger {
        self.ledger.as_ref()
    }

    pub fn best_trial(&self) -> Option<&Trial> {
        self.record.best_trial()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run trials until `n_trials` are terminal or the cancel flag is set.
    ///
    /// Trial failures never stop the loop. Failing to acquire a resource
    /// does.
    pub fn optimize(&mut self, trainer: &mut dyn Trainer) -> RwResult<StudySummary> {
        let started_at = Utc::now();
        let mut n_run = 0;
        let mut interrupted = None;

        while self.record.terminal_count() < self.config.n_trials {
            if self.cancel.is_cancelled() {
                tracing::info!(study = %self.config.name, "cancellation requested, stopping");
                break;
            }

            let resource = self.resources.acquire()?;
            let history = history_from_trials(self.record.trials());
            let params = self.sampler.suggest(&self.space, &history);
            let mut trial = Trial::new(self.record.next_id(), params);

            let state = self
                .runner
                .run(&mut trial, trainer, self.pruner.as_ref(), &resource)?;
            if state == TerminalState::Interrupted {
                tracing::warn!(trial = trial.id, "trial interrupted, it will rerun on resume");
                interrupted = Some(trial.id);
                break;
            }
            n_run += 1;

            self.record.upsert(trial.clone());
            self.persist(&trial);
            self.log_progress(&trial);
        }

        self.write_summary();

        let record = &self.record;
        Ok(StudySummary {
            session_id: self.session_id,
            study: self.config.name.clone(),
            n_trials: record.trials().len(),
            n_completed: record.count(TrialStatus::Completed),
            n_pruned: record.count(TrialStatus::Pruned),
            n_failed: record.count(TrialStatus::Failed),
            n_run,
            best: record.best_trial().cloned(),
            cancelled: self.cancel.is_cancelled(),
            interrupted,
            warnings: self.warnings.clone(),
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Record a terminal trial, retrying once. A second failure keeps the
    /// in-memory outcome and becomes a warning.
    fn persist(&mut self, trial: &Trial) {
        let Err(first) = self.ledger.record(trial) else {
            return;
        };
        tracing::warn!(trial = trial.id, error = %first, "ledger write failed, retrying");

        if let Err(second) = self.ledger.record(trial) {
            let warning = format!("trial {} was not persisted: {second}", trial.id);
            tracing::error!(trial = trial.id, error = %second, "ledger write failed twice");
            self.warnings.push(warning);
        }
    }

    fn write_summary(&mut self) {
        let summary = BestTrialSummary::from_trials(
            &self.config.name,
            self.config.direction,
            self.record.trials(),
        );
        if let Err(e) = self.ledger.write_summary(&summary) {
            tracing::error!(error = %e, "failed to write best-trial summary");
            self.warnings.push(format!("best-trial summary was not written: {e}"));
        }
    }

    fn log_progress(&self, trial: &Trial) {
        let best = self.record.best_trial();
        tracing::info!(
            trial = trial.id,
            status = %trial.status,
            final_metric = ?trial.final_metric,
            checkpoints = trial.history.len(),
            duration_s = ?trial.duration_seconds(),
            error = ?trial.error,
            best_trial = ?best.map(|t| t.id),
            best_metric = ?best.and_then(|t| t.final_metric),
            done = self.record.terminal_count(),
            total = self.config.n_trials,
            "trial finished"
        );
    }
}
