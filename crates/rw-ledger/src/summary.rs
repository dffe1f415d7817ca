//! End-of-study best-trial summary.

use chrono::{DateTime, Utc};
use rw_types::{best_of, Direction, ParamMap, Trial, TrialId, TrialStatus};
use serde::{Deserialize, Serialize};

/// Written once the study loop terminates. The best-trial fields are `null`
/// when no trial completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestTrialSummary {
    pub trial_id: Option<TrialId>,
    pub params: Option<ParamMap>,
    pub final_metric: Option<f64>,
    pub study: String,
    pub direction: Direction,
    pub n_trials: usize,
    pub n_completed: usize,
    pub n_pruned: usize,
    pub n_failed: usize,
    pub written_at: DateTime<Utc>,
}

impl BestTrialSummary {
    pub fn from_trials(study: &str, direction: Direction, trials: &[Trial]) -> Self {
        let best = best_of(trials, direction);
        let count = |status: TrialStatus| trials.iter().filter(|t| t.status == status).count();

        Self {
            trial_id: best.map(|t| t.id),
            params: best.map(|t| t.params.clone()),
            final_metric: best.and_then(|t| t.final_metric),
            study: study.to_string(),
            direction,
            n_trials: trials.len(),
            n_completed: count(TrialStatus::Completed),
            n_pruned: count(TrialStatus::Pruned),
            n_failed: count(TrialStatus::Failed),
            written_at: Utc::now(),
        }
    }
}
