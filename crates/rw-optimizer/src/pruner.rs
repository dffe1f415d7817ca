//! Early-termination decisions for running trials.
//!
//! Checkpoints are grouped into rungs at `min_resource * r^k`. When a trial
//! reaches a rung its metric is compared with every other trial that already
//! reported there; only the best `1/r` fraction keeps running.

use parking_lot::Mutex;
use rw_types::{Checkpoint, Direction, ReportError, Trial, TrialId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Outcome of reporting an intermediate metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PruneDecision {
    Continue,
    Prune,
}

/// Decides, checkpoint by checkpoint, whether a trial keeps its budget.
///
/// Reports from a running trial are staged; `complete` makes them visible to
/// later trials and `discard` drops them (failed trials never take part in
/// comparisons).
pub trait Pruner: Send + Sync {
    fn report(
        &self,
        trial_id: TrialId,
        checkpoint: Checkpoint,
        metric: f64,
    ) -> Result<PruneDecision, ReportError>;

    /// Commit the trial's reports. Called for Completed and Pruned trials.
    fn complete(&self, trial_id: TrialId);

    /// Forget the trial's reports. Called for Failed trials.
    fn discard(&self, trial_id: TrialId);

    /// Rebuild state from a trial loaded from storage.
    fn replay(&self, trial: &Trial) {
        for &(checkpoint, metric) in &trial.history {
            if self.report(trial.id, checkpoint, metric).is_err() {
                self.discard(trial.id);
                return;
            }
        }
        self.complete(trial.id);
    }

    fn name(&self) -> &str;
}

impl<P: Pruner + ?Sized> Pruner for Arc<P> {
    fn report(
        &self,
        trial_id: TrialId,
        checkpoint: Checkpoint,
        metric: f64,
    ) -> Result<PruneDecision, ReportError> {
        (**self).report(trial_id, checkpoint, metric)
    }

    fn complete(&self, trial_id: TrialId) {
        (**self).complete(trial_id)
    }

    fn discard(&self, trial_id: TrialId) {
        (**self).discard(trial_id)
    }

    fn replay(&self, trial: &Trial) {
        (**self).replay(trial)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Never prunes.
#[derive(Debug, Clone, Default)]
pub struct NopPruner;

impl Pruner for NopPruner {
    fn report(
        &self,
        _trial_id: TrialId,
        _checkpoint: Checkpoint,
        _metric: f64,
    ) -> Result<PruneDecision, ReportError> {
        Ok(PruneDecision::Continue)
    }

    fn complete(&self, _trial_id: TrialId) {}

    fn discard(&self, _trial_id: TrialId) {}

    fn name(&self) -> &str {
        "none"
    }
}

/// Successive-halving tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuccessiveHalvingConfig {
    /// Checkpoint of the first rung.
    pub min_resource: f64,
    /// Rung spacing and the kept fraction `1/r`.
    pub reduction_factor: f64,
    /// Other trials needed at a rung before anyone is pruned there.
    pub min_trials_per_rung: usize,
    /// Skips the first `s` rungs (used by hyperband brackets).
    pub min_early_stopping_rate: u32,
}

impl Default for SuccessiveHalvingConfig {
    fn default() -> Self {
        Self {
            min_resource: 1.0,
            reduction_factor: 3.0,
            min_trials_per_rung: 4,
            min_early_stopping_rate: 0,
        }
    }
}

#[derive(Debug, Default)]
struct RunningTrial {
    last_checkpoint: Option<Checkpoint>,
    /// (rung index, metric) entered but not yet committed.
    staged: Vec<(usize, f64)>,
}

#[derive(Debug, Default)]
struct RungState {
    /// Committed metrics per rung, append-only.
    rungs: Vec<Vec<f64>>,
    running: HashMap<TrialId, RunningTrial>,
    closed: HashSet<TrialId>,
}

/// Asynchronous successive halving.
#[derive(Debug)]
pub struct SuccessiveHalvingPruner {
    direction: Direction,
    config: SuccessiveHalvingConfig,
    thresholds: Vec<Checkpoint>,
    state: Mutex<RungState>,
}

impl SuccessiveHalvingPruner {
    pub fn new(direction: Direction, max_resource: f64, config: SuccessiveHalvingConfig) -> Self {
        let thresholds = rung_thresholds(&config, max_resource);
        let state = RungState {
            rungs: vec![Vec::new(); thresholds.len()],
            ..RungState::default()
        };
        Self {
            direction,
            config,
            thresholds,
            state: Mutex::new(state),
        }
    }

    /// Checkpoint at which each rung starts.
    pub fn thresholds(&self) -> &[Checkpoint] {
        &self.thresholds
    }

    /// Committed metrics at rung `k`.
    pub fn rung_reports(&self, k: usize) -> Vec<f64> {
        self.state.lock().rungs.get(k).cloned().unwrap_or_default()
    }

    fn promotable(&self, peers: &[f64], metric: f64) -> bool {
        if peers.len() < self.config.min_trials_per_rung.max(1) {
            return true;
        }

        let mut values: Vec<f64> = peers.to_vec();
        values.push(metric);
        values.sort_by(|a, b| self.direction.best_first(a, b));

        let keep = ((values.len() as f64) / self.config.reduction_factor).floor() as usize;
        let cutoff = values[keep.max(1) - 1];
        !self.direction.is_better(cutoff, metric)
    }
}

fn rung_thresholds(config: &SuccessiveHalvingConfig, max_resource: f64) -> Vec<Checkpoint> {
    let mut thresholds = Vec::new();
    if config.min_resource <= 0.0 || config.reduction_factor <= 1.0 {
        return thresholds;
    }
    let mut k = config.min_early_stopping_rate as i32;
    loop {
        let threshold = config.min_resource * config.reduction_factor.powi(k);
        if threshold > max_resource + 1e-9 {
            break;
        }
        thresholds.push(threshold);
        k += 1;
    }
    thresholds
}

impl Pruner for SuccessiveHalvingPruner {
    fn report(
        &self,
        trial_id: TrialId,
        checkpoint: Checkpoint,
        metric: f64,
    ) -> Result<PruneDecision, ReportError> {
        if !checkpoint.is_finite() {
            return Err(ReportError::NonFiniteCheckpoint { trial_id });
        }
        if !metric.is_finite() {
            return Err(ReportError::NonFiniteMetric {
                trial_id,
                checkpoint,
            });
        }

        let mut state = self.state.lock();
        if state.closed.contains(&trial_id) {
            return Err(ReportError::TrialClosed { trial_id });
        }

        let RungState { rungs, running, .. } = &mut *state;
        let trial = running.entry(trial_id).or_default();
        if let Some(previous) = trial.last_checkpoint {
            if checkpoint <= previous {
                return Err(ReportError::NonIncreasingCheckpoint {
                    trial_id,
                    previous,
                    checkpoint,
                });
            }
        }
        trial.last_checkpoint = Some(checkpoint);

        let mut rung = trial.staged.len();
        while rung < self.thresholds.len() && self.thresholds[rung] <= checkpoint + 1e-9 {
            trial.staged.push((rung, metric));
            if !self.promotable(&rungs[rung], metric) {
                tracing::debug!(
                    trial = trial_id,
                    rung,
                    checkpoint,
                    metric,
                    peers = rungs[rung].len(),
                    "trial falls outside the promoted fraction"
                );
                return Ok(PruneDecision::Prune);
            }
            rung += 1;
        }

        Ok(PruneDecision::Continue)
    }

    fn complete(&self, trial_id: TrialId) {
        let mut state = self.state.lock();
        if let Some(trial) = state.running.remove(&trial_id) {
            for (rung, metric) in trial.staged {
                state.rungs[rung].push(metric);
            }
        }
        state.closed.insert(trial_id);
    }

    fn discard(&self, trial_id: TrialId) {
        let mut state = self.state.lock();
        state.running.remove(&trial_id);
        state.closed.insert(trial_id);
    }

    fn name(&self) -> &str {
        "asha"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asha(reduction_factor: f64, min_trials_per_rung: usize) -> SuccessiveHalvingPruner {
        SuccessiveHalvingPruner::new(
            Direction::Minimize,
            4.0,
            SuccessiveHalvingConfig {
                reduction_factor,
                min_trials_per_rung,
                ..SuccessiveHalvingConfig::default()
            },
        )
    }

    fn finish(pruner: &SuccessiveHalvingPruner, id: TrialId, reports: &[(f64, f64)]) {
        for &(checkpoint, metric) in reports {
            pruner.report(id, checkpoint, metric).unwrap();
        }
        pruner.complete(id);
    }

    #[test]
    fn rungs_follow_geometric_progression() {
        let pruner = asha(2.0, 4);
        assert_eq!(pruner.thresholds(), &[1.0, 2.0, 4.0]);

        let pruner = SuccessiveHalvingPruner::new(
            Direction::Minimize,
            40.0,
            SuccessiveHalvingConfig::default(),
        );
        assert_eq!(pruner.thresholds(), &[1.0, 3.0, 9.0, 27.0]);
    }

    #[test]
    fn worse_half_is_pruned() {
        let pruner = asha(2.0, 1);

        // Trial A is first at rung 0 and always continues.
        assert_eq!(pruner.report(0, 1.0, 0.5).unwrap(), PruneDecision::Continue);
        pruner.complete(0);

        // Trial B is outside the best half of {0.5, 0.9}.
        assert_eq!(pruner.report(1, 1.0, 0.9).unwrap(), PruneDecision::Prune);
        pruner.complete(1);

        // Trial C beats A and continues.
        assert_eq!(pruner.report(2, 1.0, 0.3).unwrap(), PruneDecision::Continue);
    }

    #[test]
    fn scenario_with_default_grace_period() {
        let pruner = asha(2.0, 4);
        for (id, metric) in [(10, 0.4), (11, 0.6), (12, 0.7)] {
            finish(&pruner, id, &[(1.0, metric)]);
        }

        // A still sees only three peers: grace period.
        assert_eq!(pruner.report(0, 1.0, 0.5).unwrap(), PruneDecision::Continue);
        pruner.complete(0);

        // B sees four peers; best half of five is {0.4, 0.5}.
        assert_eq!(pruner.report(1, 1.0, 0.9).unwrap(), PruneDecision::Prune);
    }

    #[test]
    fn grace_period_never_prunes() {
        let pruner = asha(3.0, 4);
        for id in 0..4 {
            // Each later trial is far worse, but fewer than four peers exist.
            let decision = pruner.report(id, 1.0, 10.0 * (id + 1) as f64).unwrap();
            assert_eq!(decision, PruneDecision::Continue);
            pruner.complete(id);
        }
        assert_eq!(pruner.report(4, 1.0, 100.0).unwrap(), PruneDecision::Prune);
    }

    #[test]
    fn maximize_keeps_the_largest() {
        let pruner = SuccessiveHalvingPruner::new(
            Direction::Maximize,
            4.0,
            SuccessiveHalvingConfig {
                reduction_factor: 2.0,
                min_trials_per_rung: 1,
                ..SuccessiveHalvingConfig::default()
            },
        );
        finish(&pruner, 0, &[(1.0, 0.8)]);
        assert_eq!(pruner.report(1, 1.0, 0.2).unwrap(), PruneDecision::Prune);
        assert_eq!(pruner.report(2, 1.0, 0.9).unwrap(), PruneDecision::Continue);
    }

    #[test]
    fn pruned_trials_still_count_as_peers() {
        let pruner = asha(2.0, 1);
        finish(&pruner, 0, &[(1.0, 0.5)]);

        assert_eq!(pruner.report(1, 1.0, 0.9).unwrap(), PruneDecision::Prune);
        pruner.complete(1);

        assert_eq!(pruner.rung_reports(0), vec![0.5, 0.9]);
    }

    #[test]
    fn out_of_order_and_duplicate_checkpoints_are_rejected() {
        let pruner = asha(2.0, 4);
        pruner.report(0, 2.0, 0.5).unwrap();

        let err = pruner.report(0, 2.0, 0.4).unwrap_err();
        assert!(matches!(err, ReportError::NonIncreasingCheckpoint { .. }));

        let err = pruner.report(0, 1.0, 0.4).unwrap_err();
        assert_eq!(
            err,
            ReportError::NonIncreasingCheckpoint {
                trial_id: 0,
                previous: 2.0,
                checkpoint: 1.0,
            }
        );

        assert!(pruner.report(0, f64::NAN, 0.4).is_err());
        assert!(pruner.report(0, 3.0, f64::INFINITY).is_err());
    }

    #[test]
    fn discarded_trials_leave_no_trace() {
        let pruner = asha(2.0, 1);
        pruner.report(0, 1.0, 0.1).unwrap();
        pruner.report(0, 2.0, 0.1).unwrap();
        pruner.discard(0);

        assert!(pruner.rung_reports(0).is_empty());
        assert!(pruner.rung_reports(1).is_empty());
        assert_eq!(
            pruner.report(0, 3.0, 0.1).unwrap_err(),
            ReportError::TrialClosed { trial_id: 0 }
        );
    }

    #[test]
    fn staged_reports_are_invisible_until_complete() {
        let pruner = asha(2.0, 1);
        pruner.report(0, 1.0, 0.1).unwrap();
        assert!(pruner.rung_reports(0).is_empty());
        pruner.complete(0);
        assert_eq!(pruner.rung_reports(0), vec![0.1]);
    }

    #[test]
    fn fractional_checkpoints_enter_the_rung_they_cross() {
        let pruner = asha(2.0, 1);
        finish(&pruner, 0, &[(0.5, 0.9), (1.0, 0.8), (2.5, 0.4)]);
        assert_eq!(pruner.rung_reports(0), vec![0.8]);
        assert_eq!(pruner.rung_reports(1), vec![0.4]);
        assert!(pruner.rung_reports(2).is_empty());
    }

    #[test]
    fn skipping_rungs_stops_at_the_first_prune() {
        let pruner = asha(2.0, 1);
        finish(&pruner, 0, &[(1.0, 0.1), (2.0, 0.1), (4.0, 0.1)]);

        // Jumps straight to checkpoint 4 and loses at rung 0.
        assert_eq!(pruner.report(1, 4.0, 0.9).unwrap(), PruneDecision::Prune);
        pruner.complete(1);
        assert_eq!(pruner.rung_reports(0), vec![0.1, 0.9]);
        assert_eq!(pruner.rung_reports(1), vec![0.1]);
    }

    #[test]
    fn replay_rebuilds_rungs() {
        let pruner = asha(2.0, 1);
        let mut trial = Trial::new(3, Default::default());
        trial.mark_running().unwrap();
        trial.history = vec![(1.0, 0.6), (2.0, 0.5)];
        trial.mark_completed(0.45).unwrap();

        pruner.replay(&trial);
        assert_eq!(pruner.rung_reports(0), vec![0.6]);
        assert_eq!(pruner.rung_reports(1), vec![0.5]);
    }

    #[test]
    fn nop_pruner_always_continues() {
        let pruner = NopPruner;
        for checkpoint in 1..10 {
            let decision = pruner.report(0, checkpoint as f64, 1e9).unwrap();
            assert_eq!(decision, PruneDecision::Continue);
        }
    }
}
