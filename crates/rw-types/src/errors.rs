use std::path::PathBuf;

use thiserror::Error;

use crate::trial::{Direction, TrialId, TrialStatus};

/// Main error type for the Rungwise system
#[derive(Error, Debug)]
pub enum RwError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),
}

impl RwError {
    /// Errors that must stop the whole study rather than a single trial.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RwError::Config(_)
                | RwError::Resource(ResourceError::NoResourceAvailable { .. })
        )
    }
}

/// Compute resource discovery errors
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("No resource with at least {required_free_mb} MB free after {attempts} attempts")]
    NoResourceAvailable { attempts: u32, required_free_mb: u64 },

    #[error("Resource probe failed: {message}")]
    Probe { message: String },
}

/// Durable trial storage errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Trial {trial_id} is {status} and cannot be recorded until it is terminal")]
    NotTerminal { trial_id: TrialId, status: TrialStatus },

    #[error("Corrupt trial record at {}: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },

    #[error("Study was created to {stored}, cannot reopen it to {requested}")]
    DirectionMismatch {
        stored: Direction,
        requested: Direction,
    },

    #[error("No study metadata at {}", path.display())]
    MissingMetadata { path: PathBuf },
}

/// Intermediate-metric reporting contract violations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReportError {
    #[error("Trial {trial_id} reported checkpoint {checkpoint} after checkpoint {previous}")]
    NonIncreasingCheckpoint {
        trial_id: TrialId,
        previous: f64,
        checkpoint: f64,
    },

    #[error("Trial {trial_id} reported a non-finite checkpoint")]
    NonFiniteCheckpoint { trial_id: TrialId },

    #[error("Trial {trial_id} reported a non-finite metric at checkpoint {checkpoint}")]
    NonFiniteMetric { trial_id: TrialId, checkpoint: f64 },

    #[error("Trial {trial_id} reported checkpoint {checkpoint} beyond the budget of {max_checkpoint}")]
    BeyondBudget {
        trial_id: TrialId,
        checkpoint: f64,
        max_checkpoint: f64,
    },

    #[error("Trial {trial_id} is no longer accepting reports")]
    TrialClosed { trial_id: TrialId },
}

/// Trial lifecycle errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrialError {
    #[error("Trial {trial_id} cannot move from {from} to {to}")]
    InvalidTransition {
        trial_id: TrialId,
        from: TrialStatus,
        to: TrialStatus,
    },
}

/// Errors starting a training run
#[derive(Error, Debug)]
pub enum TrainerError {
    #[error("Trainer IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Trainer rejected the run: {0}")]
    Rejected(String),
}

/// Result type alias for Rungwise operations
pub type RwResult<T> = Result<T, RwError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::RwError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ReportError::NonIncreasingCheckpoint {
            trial_id: 7,
            previous: 2.0,
            checkpoint: 1.0,
        };

        let message = error.to_string();
        assert!(message.contains("Trial 7"));
        assert!(message.contains("checkpoint 1"));
        assert!(message.contains("after checkpoint 2"));
    }

    #[test]
    fn test_error_conversion() {
        let resource_error = ResourceError::NoResourceAvailable {
            attempts: 3,
            required_free_mb: 40_000,
        };
        let rw_error: RwError = resource_error.into();

        match rw_error {
            RwError::Resource(_) => (),
            _ => panic!("Expected Resource error"),
        }
        assert!(rw_error.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(config_error!("bad space: {}", "lr").is_fatal());

        let ledger: RwError = LedgerError::Io(std::io::Error::other("disk full")).into();
        assert!(!ledger.is_fatal());

        let smi_missing: RwError = ResourceError::Probe {
            message: "nvidia-smi missing".into(),
        }
        .into();
        assert!(!smi_missing.is_fatal());
    }

    #[test]
    fn test_not_terminal_display() {
        let error = LedgerError::NotTerminal {
            trial_id: 3,
            status: TrialStatus::Running,
        };
        assert!(error.to_string().contains("Running"));
    }

    #[test]
    fn test_direction_mismatch_display() {
        let error = LedgerError::DirectionMismatch {
            stored: Direction::Maximize,
            requested: Direction::Minimize,
        };
        let message = error.to_string();
        assert!(message.contains("maximize"), "{message}");
        assert!(message.contains("minimize"), "{message}");
    }
}
