//! Trial state and the in-memory study record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::errors::TrialError;
use crate::space::ParamMap;

/// Monotonic trial identifier, unique within a study.
pub type TrialId = u64;

/// Progress marker (usually an epoch number, possibly fractional).
pub type Checkpoint = f64;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Minimize,
    Maximize,
}

impl Default for Direction {
    fn default() -> Self {
        Self::Minimize
    }
}

impl Direction {
    /// Whether `a` is strictly better than `b`.
    pub fn is_better(self, a: f64, b: f64) -> bool {
        match self {
            Self::Minimize => a < b,
            Self::Maximize => a > b,
        }
    }

    /// Orders values best first.
    pub fn best_first(self, a: &f64, b: &f64) -> Ordering {
        let ord = a.partial_cmp(b).unwrap_or(Ordering::Equal);
        match self {
            Self::Minimize => ord,
            Self::Maximize => ord.reverse(),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minimize => write!(f, "minimize"),
            Self::Maximize => write!(f, "maximize"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimize" | "min" => Ok(Self::Minimize),
            "maximize" | "max" => Ok(Self::Maximize),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    Pruned,
    Completed,
    Failed,
}

impl TrialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Pruned | Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A single trial: one configuration plus its progress and outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    #[serde(rename = "trial_id")]
    pub id: TrialId,
    pub params: ParamMap,
    pub status: TrialStatus,
    /// `(checkpoint, metric)` pairs, checkpoint strictly increasing.
    pub history: Vec<(Checkpoint, f64)>,
    pub final_metric: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Trial {
    pub fn new(id: TrialId, params: ParamMap) -> Self {
        Self {
            id,
            params,
            status: TrialStatus::Pending,
            history: Vec::new(),
            final_metric: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, to: TrialStatus) -> Result<(), TrialError> {
        let allowed = match (self.status, to) {
            (TrialStatus::Pending, TrialStatus::Running) => true,
            (TrialStatus::Pending, TrialStatus::Failed) => true,
            (TrialStatus::Running, next) => next.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(TrialError::InvalidTransition {
                trial_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<(), TrialError> {
        self.transition(TrialStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_pruned(&mut self) -> Result<(), TrialError> {
        self.transition(TrialStatus::Pruned)
    }

    pub fn mark_completed(&mut self, final_metric: f64) -> Result<(), TrialError> {
        self.transition(TrialStatus::Completed)?;
        self.final_metric = Some(final_metric);
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), TrialError> {
        self.transition(TrialStatus::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }

    /// Checkpoint of the most recent intermediate report.
    pub fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.history.last().map(|(c, _)| *c)
    }

    /// Wall-clock seconds between start and the terminal transition.
    pub fn duration_seconds(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        }
    }
}

/// Pick the Completed trial with the extremal final metric under `direction`.
/// Ties go to the lowest trial id.
pub fn best_of<'a, I>(trials: I, direction: Direction) -> Option<&'a Trial>
where
    I: IntoIterator<Item = &'a Trial>,
{
    let mut best: Option<(&Trial, f64)> = None;
    for trial in trials {
        if trial.status != TrialStatus::Completed {
            continue;
        }
        let Some(value) = trial.final_metric else {
            continue;
        };
        best = match best {
            None => Some((trial, value)),
            Some((current, current_value)) => {
                if direction.is_better(value, current_value)
                    || (value == current_value && trial.id < current.id)
                {
                    Some((trial, value))
                } else {
                    Some((current, current_value))
                }
            }
        };
    }
    best.map(|(trial, _)| trial)
}

/// Ordered record of every trial in a study plus the cached best trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyRecord {
    pub direction: Direction,
    trials: Vec<Trial>,
    best_trial: Option<TrialId>,
}

impl StudyRecord {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            trials: Vec::new(),
            best_trial: None,
        }
    }

    /// Insert or replace a trial, keeping id order, and refresh the best
    /// trial when the stored trial is Completed.
    pub fn upsert(&mut self, trial: Trial) {
        let completed = trial.status == TrialStatus::Completed;
        match self.trials.binary_search_by_key(&trial.id, |t| t.id) {
            Ok(idx) => self.trials[idx] = trial,
            Err(idx) => self.trials.insert(idx, trial),
        }
        if completed {
            self.best_trial = best_of(&self.trials, self.direction).map(|t| t.id);
        }
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn get(&self, id: TrialId) -> Option<&Trial> {
        self.trials
            .binary_search_by_key(&id, |t| t.id)
            .ok()
            .map(|idx| &self.trials[idx])
    }

    pub fn best_trial(&self) -> Option<&Trial> {
        self.best_trial.and_then(|id| self.get(id))
    }

    pub fn next_id(&self) -> TrialId {
        self.trials.last().map(|t| t.id + 1).unwrap_or(0)
    }

    pub fn terminal_count(&self) -> usize {
        self.trials.iter().filter(|t| t.status.is_terminal()).count()
    }

    pub fn count(&self, status: TrialStatus) -> usize {
        self.trials.iter().filter(|t| t.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::ParameterValue;

    fn completed(id: TrialId, metric: f64) -> Trial {
        let mut trial = Trial::new(id, ParamMap::new());
        trial.mark_running().unwrap();
        trial.mark_completed(metric).unwrap();
        trial
    }

    #[test]
    fn trial_lifecycle() {
        let mut params = ParamMap::new();
        params.insert("learning_rate".into(), ParameterValue::Float(1e-4));

        let mut trial = Trial::new(1, params);
        assert_eq!(trial.status, TrialStatus::Pending);

        trial.mark_running().unwrap();
        assert_eq!(trial.status, TrialStatus::Running);
        assert!(trial.started_at.is_some());

        trial.history.push((1.0, 2.3));
        trial.mark_completed(1.8).unwrap();
        assert_eq!(trial.status, TrialStatus::Completed);
        assert_eq!(trial.final_metric, Some(1.8));
        assert!(trial.finished_at.is_some());
        assert_eq!(trial.last_checkpoint(), Some(1.0));
    }

    #[test]
    fn terminal_trials_are_immutable() {
        let mut trial = completed(0, 1.0);
        let err = trial.mark_failed("late failure").unwrap_err();
        assert_eq!(
            err,
            TrialError::InvalidTransition {
                trial_id: 0,
                from: TrialStatus::Completed,
                to: TrialStatus::Failed,
            }
        );
        assert!(trial.mark_running().is_err());
        assert_eq!(trial.final_metric, Some(1.0));
    }

    #[test]
    fn pending_cannot_complete_directly() {
        let mut trial = Trial::new(0, ParamMap::new());
        assert!(trial.mark_completed(0.1).is_err());
        assert!(trial.mark_pruned().is_err());
        trial.mark_failed("could not start").unwrap();
        assert_eq!(trial.error.as_deref(), Some("could not start"));
    }

    #[test]
    fn best_tracking_minimize() {
        let mut record = StudyRecord::new(Direction::Minimize);
        record.upsert(completed(0, 0.15));
        assert_eq!(record.best_trial().unwrap().id, 0);

        record.upsert(completed(1, 0.05));
        assert_eq!(record.best_trial().unwrap().id, 1);

        // Worse result should not replace
        record.upsert(completed(2, 0.5));
        assert_eq!(record.best_trial().unwrap().id, 1);
    }

    #[test]
    fn best_tracking_maximize() {
        let mut record = StudyRecord::new(Direction::Maximize);
        record.upsert(completed(0, 1.5));
        record.upsert(completed(1, 2.0));
        record.upsert(completed(2, 1.0));
        assert_eq!(record.best_trial().unwrap().final_metric, Some(2.0));
    }

    #[test]
    fn ties_go_to_lowest_id() {
        let mut record = StudyRecord::new(Direction::Minimize);
        record.upsert(completed(4, 0.3));
        record.upsert(completed(2, 0.3));
        record.upsert(completed(9, 0.3));
        assert_eq!(record.best_trial().unwrap().id, 2);
    }

    #[test]
    fn pruned_and_failed_never_become_best() {
        let mut record = StudyRecord::new(Direction::Minimize);

        let mut pruned = Trial::new(0, ParamMap::new());
        pruned.mark_running().unwrap();
        pruned.history.push((1.0, 0.01));
        pruned.mark_pruned().unwrap();
        record.upsert(pruned);

        let mut failed = Trial::new(1, ParamMap::new());
        failed.mark_running().unwrap();
        failed.mark_failed("diverged").unwrap();
        record.upsert(failed);

        assert!(record.best_trial().is_none());
        record.upsert(completed(2, 0.9));
        assert_eq!(record.best_trial().unwrap().id, 2);
        assert_eq!(record.terminal_count(), 3);
        assert_eq!(record.count(TrialStatus::Pruned), 1);
        assert_eq!(record.next_id(), 3);
    }

    #[test]
    fn record_json_shape() {
        let mut trial = Trial::new(5, ParamMap::new());
        trial.params.insert("grad_acc".into(), ParameterValue::Int(8));
        trial.mark_running().unwrap();
        trial.history.push((1.0, 0.7));
        trial.history.push((2.0, 0.6));
        trial.mark_completed(0.55).unwrap();

        let value = serde_json::to_value(&trial).unwrap();
        assert_eq!(value["trial_id"], 5);
        assert_eq!(value["status"], "Completed");
        assert_eq!(value["history"], serde_json::json!([[1.0, 0.7], [2.0, 0.6]]));
        assert_eq!(value["params"]["grad_acc"], 8);
        assert_eq!(value["final_metric"], 0.55);
    }

    #[test]
    fn direction_parsing() {
        assert_eq!("minimize".parse::<Direction>().unwrap(), Direction::Minimize);
        assert_eq!("MAX".parse::<Direction>().unwrap(), Direction::Maximize);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn duration_spans_running_to_terminal() {
        let mut trial = Trial::new(0, ParamMap::new());
        assert_eq!(trial.duration_seconds(), None);

        trial.mark_running().unwrap();
        assert_eq!(trial.duration_seconds(), None);

        trial.mark_completed(0.5).unwrap();
        let start = trial.started_at.unwrap();
        trial.finished_at = Some(start + chrono::Duration::seconds(90));
        assert_eq!(trial.duration_seconds(), Some(90));
    }
}
