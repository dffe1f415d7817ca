//! Study configuration.

use rw_types::{config_error, Direction, RwResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::hyperband::HyperbandPruner;
use crate::pruner::{NopPruner, Pruner, SuccessiveHalvingConfig, SuccessiveHalvingPruner};
use crate::resource::{NvidiaSmiProbe, ResourceConfig, ResourceProbe, StaticProbe};
use crate::sampler::{RandomSampler, Sampler};
use crate::tpe::{TpeConfig, TpeSampler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    Tpe,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrunerKind {
    Asha,
    Hyperband,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Gpu,
    Cpu,
}

/// Everything a study needs besides the search space and the trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    pub name: String,

    /// Where trial records, the summary and per-trial run directories live.
    /// Defaults to `<data dir>/rungwise/<name>`.
    pub output_dir: Option<PathBuf>,

    /// Total terminal trials, including ones loaded from a previous run.
    pub n_trials: usize,

    /// Checkpoint budget of a single trial (e.g. number of epochs).
    pub max_checkpoint: f64,

    pub direction: Direction,
    pub seed: u64,

    pub sampler: SamplerKind,
    pub tpe: TpeConfig,

    pub pruner: PrunerKind,
    pub successive_halving: SuccessiveHalvingConfig,

    pub device: DeviceKind,
    pub resource: ResourceConfig,
}

impl Default for StudyConfig {
    fn default() -> Self {
        Self {
            name: "study".to_string(),
            output_dir: None,
            n_trials: 50,
            max_checkpoint: 40.0,
            direction: Direction::Minimize,
            seed: 42,
            sampler: SamplerKind::Tpe,
            tpe: TpeConfig::default(),
            pruner: PrunerKind::Asha,
            successive_halving: SuccessiveHalvingConfig::default(),
            device: DeviceKind::Gpu,
            resource: ResourceConfig::default(),
        }
    }
}

impl StudyConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn from_file(path: &Path) -> RwResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| config_error!("cannot read study config {}: {e}", path.display()))?;
        serde_json::from_str(&text)
            .map_err(|e| config_error!("invalid study config {}: {e}", path.display()))
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_n_trials(mut self, n: usize) -> Self {
        self.n_trials = n;
        self
    }

    pub fn with_max_checkpoint(mut self, max_checkpoint: f64) -> Self {
        self.max_checkpoint = max_checkpoint;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerKind) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_pruner(mut self, pruner: PrunerKind) -> Self {
        self.pruner = pruner;
        self
    }

    pub fn with_successive_halving(mut self, config: SuccessiveHalvingConfig) -> Self {
        self.successive_halving = config;
        self
    }

    pub fn with_device(mut self, device: DeviceKind) -> Self {
        self.device = device;
        self
    }

    pub fn with_resource(mut self, resource: ResourceConfig) -> Self {
        self.resource = resource;
        self
    }

    /// Resolved study directory.
    pub fn study_dir(&self) -> RwResult<PathBuf> {
        if let Some(dir) = &self.output_dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|d| d.join("rungwise").join(&self.name))
            .ok_or_else(|| config_error!("no data directory on this platform; pass an output dir"))
    }

    pub fn validate(&self) -> RwResult<()> {
        if self.name.is_empty() {
            return Err(config_error!("study name must not be empty"));
        }
        if self.name.contains(['/', '\\']) {
            return Err(config_error!("study name '{}' must not contain path separators", self.name));
        }
        if self.n_trials == 0 {
            return Err(config_error!("n_trials must be at least 1"));
        }
        if !self.max_checkpoint.is_finite() || self.max_checkpoint <= 0.0 {
            return Err(config_error!("max_checkpoint must be positive, got {}", self.max_checkpoint));
        }

        let tpe = &self.tpe;
        if !(tpe.gamma > 0.0 && tpe.gamma < 1.0) {
            return Err(config_error!("tpe.gamma must be in (0, 1), got {}", tpe.gamma));
        }
        if tpe.n_ei_candidates == 0 {
            return Err(config_error!("tpe.n_ei_candidates must be at least 1"));
        }
        if !(tpe.prior_weight.is_finite() && tpe.prior_weight > 0.0) {
            return Err(config_error!("tpe.prior_weight must be positive"));
        }

        let sh = &self.successive_halving;
        if !(sh.reduction_factor.is_finite() && sh.reduction_factor > 1.0) {
            return Err(config_error!(
                "reduction_factor must be greater than 1, got {}",
                sh.reduction_factor
            ));
        }
        if !(sh.min_resource.is_finite() && sh.min_resource > 0.0) {
            return Err(config_error!("min_resource must be positive, got {}", sh.min_resource));
        }
        if self.pruner != PrunerKind::None && sh.min_resource > self.max_checkpoint {
            return Err(config_error!(
                "min_resource {} exceeds max_checkpoint {}",
                sh.min_resource,
                self.max_checkpoint
            ));
        }

        if self.resource.max_attempts == 0 {
            return Err(config_error!("resource.max_attempts must be at least 1"));
        }
        Ok(())
    }

    pub fn build_sampler(&self) -> Box<dyn Sampler> {
        match self.sampler {
            SamplerKind::Tpe => Box::new(TpeSampler::with_config(
                self.direction,
                self.seed,
                self.tpe,
            )),
            SamplerKind::Random => Box::new(RandomSampler::new(self.seed)),
        }
    }

    pub fn build_pruner(&self) -> Box<dyn Pruner> {
        match self.pruner {
            PrunerKind::Asha => Box::new(SuccessiveHalvingPruner::new(
                self.direction,
                self.max_checkpoint,
                self.successive_halving,
            )),
            PrunerKind::Hyperband => Box::new(HyperbandPruner::new(
                self.direction,
                self.max_checkpoint,
                self.successive_halving,
            )),
            PrunerKind::None => Box::new(NopPruner),
        }
    }

    pub fn build_probe(&self) -> Box<dyn ResourceProbe> {
        match self.device {
            DeviceKind::Gpu => Box::new(NvidiaSmiProbe::default()),
            DeviceKind::Cpu => Box::new(StaticProbe::cpu()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rw_types::RwError;

    #[test]
    fn defaults_validate() {
        let config = StudyConfig::new("lora-sweep");
        config.validate().unwrap();
        assert_eq!(config.n_trials, 50);
        assert_eq!(config.max_checkpoint, 40.0);
        assert_eq!(config.build_sampler().name(), "tpe");
        assert_eq!(config.build_pruner().name(), "asha");
    }

    #[test]
    fn builders_select_components() {
        let config = StudyConfig::new("s")
            .with_sampler(SamplerKind::Random)
            .with_pruner(PrunerKind::Hyperband)
            .with_device(DeviceKind::Cpu)
            .with_output_dir("/tmp/rungwise-s");
        assert_eq!(config.build_sampler().name(), "random");
        assert_eq!(config.build_pruner().name(), "hyperband");
        assert_eq!(config.study_dir().unwrap(), PathBuf::from("/tmp/rungwise-s"));

        let config = config.with_pruner(PrunerKind::None);
        assert_eq!(config.build_pruner().name(), "none");
    }

    #[test]
    fn rejects_bad_values() {
        let bad = [
            StudyConfig::new(""),
            StudyConfig::new("a/b"),
            StudyConfig::new("s").with_n_trials(0),
            StudyConfig::new("s").with_max_checkpoint(0.0),
            StudyConfig::new("s").with_max_checkpoint(f64::NAN),
            StudyConfig::new("s").with_successive_halving(SuccessiveHalvingConfig {
                reduction_factor: 1.0,
                ..SuccessiveHalvingConfig::default()
            }),
            StudyConfig::new("s").with_successive_halving(SuccessiveHalvingConfig {
                min_resource: 100.0,
                ..SuccessiveHalvingConfig::default()
            }),
        ];
        for config in bad {
            let err = config.validate().unwrap_err();
            assert!(matches!(err, RwError::Config(_)), "{config:?}");
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: StudyConfig = serde_json::from_str(
            r#"{"name": "resume", "n_trials": 8, "pruner": "hyperband",
                "successive_halving": {"reduction_factor": 2.0},
                "resource": {"required_free_mb": 40000}}"#,
        )
        .unwrap();
        assert_eq!(config.n_trials, 8);
        assert_eq!(config.pruner, PrunerKind::Hyperband);
        assert_eq!(config.successive_halving.reduction_factor, 2.0);
        assert_eq!(config.successive_halving.min_trials_per_rung, 4);
        assert_eq!(config.resource.required_free_mb, 40_000);
        assert_eq!(config.resource.max_attempts, 5);
        assert_eq!(config.sampler, SamplerKind::Tpe);
    }

    #[test]
    fn from_file_reports_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(StudyConfig::from_file(&path), Err(RwError::Config(_))));
        assert!(matches!(
            StudyConfig::from_file(&dir.path().join("missing.json")),
            Err(RwError::Config(_))
        ));
    }
}
