//! Tree-structured Parzen Estimator sampler.
//!
//! Finished trials are ranked by objective (pruned trials after completed
//! ones) and split into a "good" set (the best `gamma` fraction) and a "bad"
//! set (everything else). Each parameter gets one density estimate per set; candidates are
//! drawn from the good density and the one maximizing `l(x) / g(x)` wins.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rw_types::{Direction, Distribution, ParamMap, ParameterValue, SearchSpace};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::sampler::{sample_prior_space, Observation, Sampler};

/// Tunables for [`TpeSampler`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TpeConfig {
    /// Completed or pruned trials required before the density model is used.
    pub n_startup_trials: usize,
    /// Fraction of ranked trials treated as "good".
    pub gamma: f64,
    /// Candidates drawn from the good density per parameter.
    pub n_ei_candidates: usize,
    /// Weight of the prior component in every estimator.
    pub prior_weight: f64,
}

impl Default for TpeConfig {
    fn default() -> Self {
        Self {
            n_startup_trials: 10,
            gamma: 0.25,
            n_ei_candidates: 24,
            prior_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TpeSampler {
    config: TpeConfig,
    direction: Direction,
    rng: ChaCha8Rng,
}

impl TpeSampler {
    pub fn new(direction: Direction, seed: u64) -> Self {
        Self::with_config(direction, seed, TpeConfig::default())
    }

    pub fn with_config(direction: Direction, seed: u64, config: TpeConfig) -> Self {
        Self {
            config,
            direction,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &TpeConfig {
        &self.config
    }

    /// Whether `history` is long enough for the density model to be used.
    pub fn is_warmed_up(&self, history: &[Observation]) -> bool {
        !history.is_empty() && history.len() >= self.config.n_startup_trials
    }

    /// Split observations into (good, bad). Returns `None` while the model is
    /// still warming up.
    ///
    /// Completed trials rank ahead of pruned ones. Pruned trials rank by the
    /// checkpoint they reached, then by their last reported metric, so a
    /// study where nearly everything is pruned still has a good set.
    fn split<'a>(
        &self,
        history: &'a [Observation],
    ) -> Option<(Vec<&'a Observation>, Vec<&'a Observation>)> {
        if !self.is_warmed_up(history) {
            return None;
        }

        let mut completed: Vec<(&Observation, f64)> = history
            .iter()
            .filter_map(|o| o.value.filter(|v| v.is_finite()).map(|v| (o, v)))
            .collect();
        // Stable: equal objectives keep history order.
        completed.sort_by(|a, b| self.direction.best_first(&a.1, &b.1));

        let mut pruned: Vec<&Observation> = history
            .iter()
            .filter(|o| !o.value.is_some_and(f64::is_finite))
            .collect();
        pruned.sort_by(|a, b| match (a.last_report, b.last_report) {
            (Some((ca, ma)), Some((cb, mb))) => cb
                .total_cmp(&ca)
                .then_with(|| self.direction.best_first(&ma, &mb)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });

        let ranked: Vec<&Observation> = completed
            .into_iter()
            .map(|(o, _)| o)
            .chain(pruned)
            .collect();

        let n = ranked.len();
        let n_good = ((n as f64) * self.config.gamma).ceil() as usize;
        let n_good = n_good.clamp(1, n);

        let bad = ranked[n_good..].to_vec();
        let mut good = ranked;
        good.truncate(n_good);
        Some((good, bad))
    }

    fn sample_numeric(
        &mut self,
        name: &str,
        low: f64,
        high: f64,
        log: bool,
        good: &[&Observation],
        bad: &[&Observation],
    ) -> ParameterValue {
        let to_internal = |v: f64| if log { v.ln() } else { v };
        let values = |set: &[&Observation]| -> Vec<f64> {
            set.iter()
                .filter_map(|o| o.params.get(name)?.as_float())
                .filter(|v| *v >= low && *v <= high)
                .map(to_internal)
                .collect()
        };

        let (lo, hi) = (to_internal(low), to_internal(high));
        let l = ParzenEstimator::new(&values(good), lo, hi, self.config.prior_weight);
        let g = ParzenEstimator::new(&values(bad), lo, hi, self.config.prior_weight);

        let mut best = l.sample(&mut self.rng);
        let mut best_score = l.log_pdf(best) - g.log_pdf(best);
        for _ in 1..self.config.n_ei_candidates.max(1) {
            let candidate = l.sample(&mut self.rng);
            let score = l.log_pdf(candidate) - g.log_pdf(candidate);
            if score > best_score {
                best = candidate;
                best_score = score;
            }
        }

        let value = if log { best.exp() } else { best };
        ParameterValue::Float(value.clamp(low, high))
    }

    fn sample_categorical(
        &mut self,
        name: &str,
        choices: &[ParameterValue],
        good: &[&Observation],
        bad: &[&Observation],
    ) -> ParameterValue {
        let l = self.choice_weights(name, choices, good);
        let g = self.choice_weights(name, choices, bad);

        let mut best = pick_weighted(&l, &mut self.rng);
        let mut best_score = l[best].ln() - g[best].ln();
        for _ in 1..self.config.n_ei_candidates.max(1) {
            let idx = pick_weighted(&l, &mut self.rng);
            let score = l[idx].ln() - g[idx].ln();
            if score > best_score {
                best = idx;
                best_score = score;
            }
        }
        choices[best].clone()
    }

    /// Laplace-smoothed choice frequencies, normalized.
    fn choice_weights(
        &self,
        name: &str,
        choices: &[ParameterValue],
        set: &[&Observation],
    ) -> Vec<f64> {
        let mut weights = vec![self.config.prior_weight; choices.len()];
        for obs in set {
            if let Some(value) = obs.params.get(name) {
                if let Some(idx) = choices.iter().position(|c| c == value) {
                    weights[idx] += 1.0;
                }
            }
        }
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return vec![1.0 / choices.len() as f64; choices.len()];
        }
        weights.iter().map(|w| w / total).collect()
    }
}

impl Sampler for TpeSampler {
    fn suggest(&mut self, space: &SearchSpace, history: &[Observation]) -> ParamMap {
        let Some((good, bad)) = self.split(history) else {
            return sample_prior_space(space, &mut self.rng);
        };

        let mut params = ParamMap::new();
        for (name, dist) in space.iter() {
            let value = match dist {
                Distribution::Categorical { choices } => {
                    self.sample_categorical(name, choices, &good, &bad)
                }
                Distribution::Uniform { low, high } => {
                    self.sample_numeric(name, *low, *high, false, &good, &bad)
                }
                Distribution::LogUniform { low, high } => {
                    self.sample_numeric(name, *low, *high, true, &good, &bad)
                }
            };
            params.insert(name.clone(), value);
        }
        params
    }

    fn name(&self) -> &str {
        "tpe"
    }
}

fn pick_weighted<R: Rng>(weights: &[f64], rng: &mut R) -> usize {
    let r: f64 = rng.random();
    let mut cumsum = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumsum += w;
        if r < cumsum {
            return i;
        }
    }
    weights.len() - 1
}

/// Mixture of Gaussians truncated to `[low, high]`, one component per
/// observation plus a wide prior component.
#[derive(Debug, Clone)]
struct ParzenEstimator {
    mus: Vec<f64>,
    sigmas: Vec<f64>,
    weights: Vec<f64>,
    low: f64,
    high: f64,
}

impl ParzenEstimator {
    fn new(observations: &[f64], low: f64, high: f64, prior_weight: f64) -> Self {
        let range = high - low;
        let prior_mu = low + 0.5 * range;

        let mut points: Vec<(f64, bool)> = observations
            .iter()
            .map(|&mu| (mu, false))
            .chain(std::iter::once((prior_mu, true)))
            .collect();
        points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

        let n = points.len();
        let min_sigma = range / (n + 1).min(100) as f64;

        let mut mus = Vec::with_capacity(n);
        let mut sigmas = Vec::with_capacity(n);
        let mut weights = Vec::with_capacity(n);
        for (i, &(mu, is_prior)) in points.iter().enumerate() {
            let left = if i == 0 { mu - low } else { mu - points[i - 1].0 };
            let right = if i + 1 == n { high - mu } else { points[i + 1].0 - mu };
            let sigma = if is_prior {
                range
            } else {
                left.max(right).clamp(min_sigma, range)
            };
            mus.push(mu);
            sigmas.push(sigma);
            weights.push(if is_prior { prior_weight.max(1e-12) } else { 1.0 });
        }

        let total: f64 = weights.iter().sum();
        for w in &mut weights {
            *w /= total;
        }

        Self {
            mus,
            sigmas,
            weights,
            low,
            high,
        }
    }

    fn sample<R: Rng>(&self, rng: &mut R) -> f64 {
        let idx = pick_weighted(&self.weights, rng);
        let (mu, sigma) = (self.mus[idx], self.sigmas[idx]);

        for _ in 0..64 {
            let x = mu + sigma * standard_normal(rng);
            if x >= self.low && x <= self.high {
                return x;
            }
        }
        rng.random_range(self.low..self.high)
    }

    fn log_pdf(&self, x: f64) -> f64 {
        let density: f64 = self
            .mus
            .iter()
            .zip(&self.sigmas)
            .zip(&self.weights)
            .map(|((&mu, &sigma), &w)| {
                let mass =
                    normal_cdf((self.high - mu) / sigma) - normal_cdf((self.low - mu) / sigma);
                let z = (x - mu) / sigma;
                let pdf = (-0.5 * z * z).exp() / (sigma * (2.0 * std::f64::consts::PI).sqrt());
                w * pdf / mass.max(1e-12)
            })
            .sum();
        density.max(f64::MIN_POSITIVE).ln()
    }
}

/// Box-Muller transform.
fn standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.random::<f64>().max(1e-12);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Abramowitz & Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = ((((1.061405429 * t - 1.453152027) * t + 1.421413741) * t - 0.284496736) * t
        + 0.254829592)
        * t;
    sign * (1.0 - poly * (-x * x).exp())
}
