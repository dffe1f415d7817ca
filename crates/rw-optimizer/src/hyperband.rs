//! Hyperband: several successive-halving brackets with staggered first rungs.
//!
//! Based on Li et al. (2018). Bracket `s` only starts comparing trials at
//! `min_resource * r^s`, so aggressive and conservative early stopping run
//! side by side. Every trial belongs to exactly one bracket and is only
//! compared against trials of that bracket.

use rw_types::{Checkpoint, Direction, ReportError, TrialId};

use crate::pruner::{PruneDecision, Pruner, SuccessiveHalvingConfig, SuccessiveHalvingPruner};

#[derive(Debug)]
pub struct HyperbandPruner {
    brackets: Vec<SuccessiveHalvingPruner>,
    /// Relative share of trials sent to each bracket.
    budgets: Vec<usize>,
}

impl HyperbandPruner {
    pub fn new(direction: Direction, max_resource: f64, config: SuccessiveHalvingConfig) -> Self {
        let n_brackets = n_brackets(&config, max_resource);
        let brackets = (0..n_brackets)
            .map(|s| {
                let bracket_config = SuccessiveHalvingConfig {
                    min_early_stopping_rate: s as u32,
                    ..config
                };
                SuccessiveHalvingPruner::new(direction, max_resource, bracket_config)
            })
            .collect();
        let budgets = (0..n_brackets)
            .map(|s| bracket_budget(n_brackets, s, config.reduction_factor))
            .collect();

        Self { brackets, budgets }
    }

    pub fn n_brackets(&self) -> usize {
        self.brackets.len()
    }

    /// Bracket index for a trial, stable across restarts.
    pub fn bracket_of(&self, trial_id: TrialId) -> usize {
        let total: usize = self.budgets.iter().sum();
        let mut slot = (splitmix64(trial_id) % total as u64) as usize;
        for (s, budget) in self.budgets.iter().enumerate() {
            if slot < *budget {
                return s;
            }
            slot -= budget;
        }
        self.budgets.len() - 1
    }

    pub fn bracket(&self, s: usize) -> Option<&SuccessiveHalvingPruner> {
        self.brackets.get(s)
    }
}

fn n_brackets(config: &SuccessiveHalvingConfig, max_resource: f64) -> usize {
    if config.min_resource <= 0.0 || config.reduction_factor <= 1.0 {
        return 1;
    }
    let ratio = max_resource / config.min_resource;
    if ratio < 1.0 {
        return 1;
    }
    // Small epsilon so exact powers (e.g. 27 / 1 with r = 3) are not lost to rounding.
    (ratio.ln() / config.reduction_factor.ln() + 1e-9).floor() as usize + 1
}

fn bracket_budget(n_brackets: usize, s: usize, reduction_factor: f64) -> usize {
    let n = n_brackets as f64;
    let budget = n * reduction_factor.powi((n_brackets - 1 - s) as i32) / (n - s as f64);
    (budget.ceil() as usize).max(1)
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

impl Pruner for HyperbandPruner {
    fn report(
        &self,
        trial_id: TrialId,
        checkpoint: Checkpoint,
        metric: f64,
    ) -> Result<PruneDecision, ReportError> {
        self.brackets[self.bracket_of(trial_id)].report(trial_id, checkpoint, metric)
    }

    fn complete(&self, trial_id: TrialId) {
        self.brackets[self.bracket_of(trial_id)].complete(trial_id);
    }

    fn discard(&self, trial_id: TrialId) {
        self.brackets[self.bracket_of(trial_id)].discard(trial_id);
    }

    fn name(&self) -> &str {
        "hyperband"
    }
}
