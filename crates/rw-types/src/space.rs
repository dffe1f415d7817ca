//! Search space definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::{RwError, RwResult};

/// A concrete parameter value, stored as a plain JSON scalar.
///
/// Variant order matters for deserialization: `2` reads back as `Int`, `2.0`
/// as `Float`, so categorical integer choices and float samples both survive
/// a round trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl ParameterValue {
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl std::fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// One sampled configuration, keyed by parameter name.
pub type ParamMap = BTreeMap<String, ParameterValue>;

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Distribution {
    /// One of a fixed set of choices.
    Categorical { choices: Vec<ParameterValue> },
    /// Continuous uniform range [low, high].
    Uniform { low: f64, high: f64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
}

impl Distribution {
    fn validate(&self, name: &str) -> RwResult<()> {
        match self {
            Self::Categorical { choices } => {
                if choices.is_empty() {
                    return Err(crate::config_error!(
                        "parameter '{name}': categorical choices cannot be empty"
                    ));
                }
            }
            Self::Uniform { low, high } | Self::LogUniform { low, high } => {
                if !low.is_finite() || !high.is_finite() {
                    return Err(crate::config_error!(
                        "parameter '{name}': bounds must be finite"
                    ));
                }
                if low >= high {
                    return Err(crate::config_error!(
                        "parameter '{name}': low ({low}) must be less than high ({high})"
                    ));
                }
                if matches!(self, Self::LogUniform { .. }) && *low <= 0.0 {
                    return Err(crate::config_error!(
                        "parameter '{name}': log-uniform low ({low}) must be positive"
                    ));
                }
            }
        }
        Ok(())
    }

    /// Whether `value` could have been drawn from this distribution.
    pub fn contains(&self, value: &ParameterValue) -> bool {
        match self {
            Self::Categorical { choices } => choices.contains(value),
            Self::Uniform { low, high } | Self::LogUniform { low, high } => value
                .as_float()
                .map(|v| v >= *low && v <= *high)
                .unwrap_or(false),
        }
    }
}

/// The full search space: parameter name to distribution, iterated in name
/// order so sampling is reproducible.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchSpace {
    pub parameters: BTreeMap<String, Distribution>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_categorical(
        mut self,
        name: impl Into<String>,
        choices: Vec<ParameterValue>,
    ) -> Self {
        self.parameters
            .insert(name.into(), Distribution::Categorical { choices });
        self
    }

    pub fn add_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters
            .insert(name.into(), Distribution::Uniform { low, high });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters
            .insert(name.into(), Distribution::LogUniform { low, high });
        self
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Distribution)> {
        self.parameters.iter()
    }

    /// Check every invariant of the space. A malformed space is fatal.
    pub fn validate(&self) -> RwResult<()> {
        if self.parameters.is_empty() {
            return Err(crate::config_error!("search space has no parameters"));
        }
        for (name, dist) in &self.parameters {
            dist.validate(name)?;
        }
        Ok(())
    }

    /// Parse and validate a search space from its JSON description.
    pub fn from_json(json: &str) -> RwResult<Self> {
        let space: Self = serde_json::from_str(json)
            .map_err(|e| RwError::Config(format!("malformed search space: {e}")))?;
        space.validate()?;
        Ok(space)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> RwResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            RwError::Config(format!("cannot read search space {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_description() {
        let space = SearchSpace::from_json(
            r#"{
                "learning_rate": {"type": "log_uniform", "low": 1e-5, "high": 5e-4},
                "weight_decay": {"type": "uniform", "low": 0.001, "high": 0.01},
                "grad_acc": {"type": "categorical", "choices": [2, 4, 8, 16, 32]}
            }"#,
        )
        .unwrap();

        assert_eq!(space.len(), 3);
        assert_eq!(
            space.parameters["grad_acc"],
            Distribution::Categorical {
                choices: vec![
                    ParameterValue::Int(2),
                    ParameterValue::Int(4),
                    ParameterValue::Int(8),
                    ParameterValue::Int(16),
                    ParameterValue::Int(32),
                ]
            }
        );
        let names: Vec<_> = space.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["grad_acc", "learning_rate", "weight_decay"]);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let space = SearchSpace::new().add_uniform("x", 1.0, 1.0);
        assert!(matches!(space.validate(), Err(RwError::Config(_))));
    }

    #[test]
    fn rejects_non_positive_log_bound() {
        let space = SearchSpace::new().add_log_uniform("lr", 0.0, 1.0);
        let err = space.validate().unwrap_err();
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn rejects_empty_choices_and_empty_space() {
        let space = SearchSpace::new().add_categorical("act", vec![]);
        assert!(space.validate().is_err());
        assert!(SearchSpace::new().validate().is_err());
    }

    #[test]
    fn rejects_unknown_distribution_type() {
        let result = SearchSpace::from_json(r#"{"x": {"type": "normal", "mean": 0.0}}"#);
        assert!(matches!(result, Err(RwError::Config(_))));
    }

    #[test]
    fn parameter_values_keep_their_kind() {
        let values = vec![
            ParameterValue::Int(2),
            ParameterValue::Float(3.0),
            ParameterValue::Float(1.25e-4),
            ParameterValue::Bool(true),
            ParameterValue::Text("gelu".into()),
        ];
        let json = serde_json::to_string(&values).unwrap();
        let back: Vec<ParameterValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(values, back);
    }

    #[test]
    fn contains_checks_membership() {
        let dist = Distribution::LogUniform { low: 1e-5, high: 1e-2 };
        assert!(dist.contains(&ParameterValue::Float(1e-3)));
        assert!(!dist.contains(&ParameterValue::Float(0.5)));
        assert!(!dist.contains(&ParameterValue::Text("x".into())));

        let cat = Distribution::Categorical {
            choices: vec!["relu".into(), "gelu".into()],
        };
        assert!(cat.contains(&"gelu".into()));
        assert!(!cat.contains(&"tanh".into()));
    }
}
