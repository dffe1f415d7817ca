//! # rw-optimizer
//!
//! Hyperparameter search orchestration for Rungwise.
//!
//! Provides samplers (random and tree-structured Parzen estimator), pruners
//! (successive halving and hyperband), compute resource selection, the
//! single-trial runner with its training collaborator traits, and the study
//! loop that ties them to a metrics ledger.

pub mod config;
pub mod hyperband;
pub mod process;
pub mod pruner;
pub mod resource;
pub mod runner;
pub mod sampler;
pub mod study;
pub mod tpe;

pub use config::{DeviceKind, PrunerKind, SamplerKind, StudyConfig};
pub use hyperband::HyperbandPruner;
pub use process::ProcessTrainer;
pub use pruner::{NopPruner, PruneDecision, Pruner, SuccessiveHalvingConfig, SuccessiveHalvingPruner};
pub use resource::{
    NvidiaSmiProbe, ResourceConfig, ResourceHandle, ResourceInfo, ResourceKind, ResourceProbe,
    ResourceSelector, StaticProbe,
};
pub use runner::{
    CancelFlag, RunConfig, ScriptedTrainer, TerminalState, Trainer, TrainingSession, TrainingStep,
    TrialRunner,
};
pub use sampler::{history_from_trials, Observation, RandomSampler, Sampler};
pub use study::{Study, StudyBuilder, StudySummary};
pub use tpe::{TpeConfig, TpeSampler};
