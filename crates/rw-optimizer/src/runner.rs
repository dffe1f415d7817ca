//! Driving a single trial through the training collaborator.

use parking_lot::Mutex;
use rw_types::{
    Checkpoint, ParamMap, ReportError, TrainerError, Trial, TrialError, TrialId,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::pruner::{PruneDecision, Pruner};
use crate::resource::ResourceHandle;

/// Shared stop request, set from outside the study loop (e.g. on ctrl-c).
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the training collaborator is told about a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub trial_id: TrialId,
    pub run_name: String,
    pub output_dir: PathBuf,
    pub params: ParamMap,
    pub max_checkpoint: Checkpoint,
}

/// One event from a running training session.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingStep {
    Checkpoint { checkpoint: Checkpoint, metric: f64 },
    Done { final_metric: f64 },
    Failed { reason: String },
}

/// A running training job. `step` blocks until the next event.
pub trait TrainingSession: Send {
    fn step(&mut self) -> TrainingStep;

    /// Ask the job to stop. Must return once the job is gone.
    fn cancel(&mut self);
}

/// Starts training jobs for trials.
pub trait Trainer: Send {
    fn start(
        &mut self,
        config: &RunConfig,
        resource: &ResourceHandle,
    ) -> Result<Box<dyn TrainingSession>, TrainerError>;
}

/// How a trial ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalState {
    Completed { final_metric: f64 },
    Pruned { checkpoint: Checkpoint },
    Failed { reason: String },
    /// Stopped by the study's cancel flag. The trial is marked Failed with
    /// reason `cancelled`.
    Interrupted,
}

/// Runs trials one at a time against a trainer, relaying progress to a pruner.
#[derive(Debug, Clone)]
pub struct TrialRunner {
    study: String,
    runs_dir: PathBuf,
    max_checkpoint: Checkpoint,
    cancel: CancelFlag,
}

impl TrialRunner {
    pub fn new(
        study: &str,
        study_dir: &Path,
        max_checkpoint: Checkpoint,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            study: study.to_string(),
            runs_dir: study_dir.join("runs"),
            max_checkpoint,
            cancel,
        }
    }

    pub fn run_config(&self, trial: &Trial) -> RunConfig {
        let run_name = format!("{}_{}", self.study, trial.id);
        RunConfig {
            trial_id: trial.id,
            output_dir: self.runs_dir.join(&run_name),
            run_name,
            params: trial.params.clone(),
            max_checkpoint: self.max_checkpoint,
        }
    }

    /// Run a Pending trial to a terminal state.
    ///
    /// The pruner commits the trial's rung reports when it ends Completed or
    /// Pruned and discards them when it fails.
    pub fn run(
        &self,
        trial: &mut Trial,
        trainer: &mut dyn Trainer,
        pruner: &dyn Pruner,
        resource: &ResourceHandle,
    ) -> Result<TerminalState, TrialError> {
        trial.mark_running()?;
        let config = self.run_config(trial);
        tracing::info!(trial = trial.id, run = %config.run_name, resource = %resource, "trial started");

        let state = self.drive(trial, &config, trainer, pruner, resource);
        match &state {
            TerminalState::Completed { final_metric } => {
                pruner.complete(trial.id);
                trial.mark_completed(*final_metric)?;
            }
            TerminalState::Pruned { .. } => {
                pruner.complete(trial.id);
                trial.mark_pruned()?;
            }
            TerminalState::Failed { reason } => {
                pruner.discard(trial.id);
                trial.mark_failed(reason.clone())?;
            }
            TerminalState::Interrupted => {
                pruner.discard(trial.id);
                trial.mark_failed("cancelled")?;
            }
        }
        Ok(state)
    }

    fn drive(
        &self,
        trial: &mut Trial,
        config: &RunConfig,
        trainer: &mut dyn Trainer,
        pruner: &dyn Pruner,
        resource: &ResourceHandle,
    ) -> TerminalState {
        let mut session = match trainer.start(config, resource) {
            Ok(session) => session,
            Err(e) => {
                return TerminalState::Failed {
                    reason: format!("failed to start: {e}"),
                }
            }
        };

        loop {
            if self.cancel.is_cancelled() {
                session.cancel();
                return TerminalState::Interrupted;
            }

            match session.step() {
                TrainingStep::Checkpoint { checkpoint, metric } => {
                    let decision = self
                        .check_report(trial, checkpoint, metric)
                        .and_then(|_| pruner.report(trial.id, checkpoint, metric));
                    match decision {
                        Ok(PruneDecision::Continue) => {
                            tracing::debug!(trial = trial.id, checkpoint, metric, "checkpoint");
                            trial.history.push((checkpoint, metric));
                        }
                        Ok(PruneDecision::Prune) => {
                            trial.history.push((checkpoint, metric));
                            session.cancel();
                            return TerminalState::Pruned { checkpoint };
                        }
                        Err(e) => {
                            session.cancel();
                            return TerminalState::Failed {
                                reason: e.to_string(),
                            };
                        }
                    }
                }
                TrainingStep::Done { final_metric } if final_metric.is_finite() => {
                    return TerminalState::Completed { final_metric };
                }
                TrainingStep::Done { final_metric } => {
                    return TerminalState::Failed {
                        reason: format!("non-finite final metric {final_metric}"),
                    };
                }
                TrainingStep::Failed { reason } => {
                    return TerminalState::Failed { reason };
                }
            }
        }
    }

    /// Checkpoint contract shared by every pruner.
    fn check_report(
        &self,
        trial: &Trial,
        checkpoint: Checkpoint,
        metric: f64,
    ) -> Result<(), ReportError> {
        let trial_id = trial.id;
        if !checkpoint.is_finite() {
            return Err(ReportError::NonFiniteCheckpoint { trial_id });
        }
        if !metric.is_finite() {
            return Err(ReportError::NonFiniteMetric {
                trial_id,
                checkpoint,
            });
        }
        if checkpoint > self.max_checkpoint + 1e-9 {
            return Err(ReportError::BeyondBudget {
                trial_id,
                checkpoint,
                max_checkpoint: self.max_checkpoint,
            });
        }
        if let Some(previous) = trial.last_checkpoint() {
            if checkpoint <= previous {
                return Err(ReportError::NonIncreasingCheckpoint {
                    trial_id,
                    previous,
                    checkpoint,
                });
            }
        }
        Ok(())
    }
}

type Script = Box<dyn FnMut(&RunConfig) -> Vec<TrainingStep> + Send>;

/// In-process trainer that replays a precomputed list of steps per trial.
pub struct ScriptedTrainer {
    script: Script,
    started: Arc<Mutex<Vec<TrialId>>>,
    cancelled: Arc<Mutex<Vec<TrialId>>>,
}

impl ScriptedTrainer {
    pub fn new(script: impl FnMut(&RunConfig) -> Vec<TrainingStep> + Send + 'static) -> Self {
        Self {
            script: Box::new(script),
            started: Arc::default(),
            cancelled: Arc::default(),
        }
    }

    pub fn started(&self) -> Vec<TrialId> {
        self.started.lock().clone()
    }

    /// Trials whose session was cancelled (pruned or stopped).
    pub fn cancelled(&self) -> Vec<TrialId> {
        self.cancelled.lock().clone()
    }
}

impl Trainer for ScriptedTrainer {
    fn start(
        &mut self,
        config: &RunConfig,
        _resource: &ResourceHandle,
    ) -> Result<Box<dyn TrainingSession>, TrainerError> {
        self.started.lock().push(config.trial_id);
        Ok(Box::new(ScriptedSession {
            trial_id: config.trial_id,
            steps: (self.script)(config).into(),
            cancelled: Arc::clone(&self.cancelled),
        }))
    }
}

struct ScriptedSession {
    trial_id: TrialId,
    steps: VecDeque<TrainingStep>,
    cancelled: Arc<Mutex<Vec<TrialId>>>,
}

impl TrainingSession for ScriptedSession {
    fn step(&mut self) -> TrainingStep {
        self.steps.pop_front().unwrap_or(TrainingStep::Failed {
            reason: "script ended without a final metric".to_string(),
        })
    }

    fn cancel(&mut self) {
        self.steps.clear();
        self.cancelled.lock().push(self.trial_id);
    }
}
