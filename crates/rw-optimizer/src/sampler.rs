//! Sampler abstraction and prior (random) sampling.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rw_types::{
    Checkpoint, Distribution, ParamMap, ParameterValue, SearchSpace, Trial, TrialStatus,
};

/// One terminal, non-failed trial as seen by a sampler.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub params: ParamMap,
    /// Final objective; `None` for pruned trials.
    pub value: Option<f64>,
    /// Last intermediate report of a pruned trial.
    pub last_report: Option<(Checkpoint, f64)>,
}

impl Observation {
    /// Completed and Pruned trials become observations; everything else is
    /// invisible to samplers.
    pub fn from_trial(trial: &Trial) -> Option<Self> {
        match trial.status {
            TrialStatus::Completed => Some(Self {
                params: trial.params.clone(),
                value: trial.final_metric,
                last_report: None,
            }),
            TrialStatus::Pruned => Some(Self {
                params: trial.params.clone(),
                value: None,
                last_report: trial.history.last().copied(),
            }),
            _ => None,
        }
    }
}

/// Build sampler history from a study's trials.
pub fn history_from_trials(trials: &[Trial]) -> Vec<Observation> {
    trials.iter().filter_map(Observation::from_trial).collect()
}

/// Common trait for all samplers.
pub trait Sampler: Send {
    /// Propose the next configuration given everything observed so far.
    fn suggest(&mut self, space: &SearchSpace, history: &[Observation]) -> ParamMap;

    /// Human-readable sampler name.
    fn name(&self) -> &str;
}

/// Draw one value from a parameter's prior distribution.
pub(crate) fn sample_prior<R: Rng>(dist: &Distribution, rng: &mut R) -> ParameterValue {
    match dist {
        Distribution::Categorical { choices } => {
            let idx = rng.random_range(0..choices.len());
            choices[idx].clone()
        }
        Distribution::Uniform { low, high } => {
            ParameterValue::Float(rng.random_range(*low..*high))
        }
        Distribution::LogUniform { low, high } => {
            let log_val: f64 = rng.random_range(low.ln()..high.ln());
            ParameterValue::Float(log_val.exp().clamp(*low, *high))
        }
    }
}

pub(crate) fn sample_prior_space<R: Rng>(space: &SearchSpace, rng: &mut R) -> ParamMap {
    space
        .iter()
        .map(|(name, dist)| (name.clone(), sample_prior(dist, rng)))
        .collect()
}

/// Independent sampling from each parameter's prior.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    rng: ChaCha8Rng,
}

impl RandomSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl Sampler for RandomSampler {
    fn suggest(&mut self, space: &SearchSpace, _history: &[Observation]) -> ParamMap {
        sample_prior_space(space, &mut self.rng)
    }

    fn name(&self) -> &str {
        "random"
    }
}
