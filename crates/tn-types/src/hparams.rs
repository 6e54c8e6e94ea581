//! Hyperparameter search-space definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Concrete hyperparameter values handed to one trial.
pub type HParams = BTreeMap<String, serde_json::Value>;

/// A single hyperparameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Hyperparameter name as seen by the training code (e.g. "learning_rate").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a hyperparameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    /// Fixed value, passed through unchanged.
    Const { value: serde_json::Value },
    /// Continuous uniform range [low, high].
    Double { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    Int { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    Log { low: f64, high: f64 },
    /// Categorical choices.
    Categorical { values: Vec<serde_json::Value> },
}

/// The full search space: an ordered list of hyperparameter definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, name: impl Into<String>, kind: ParameterKind) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn add_const(self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.push(name, ParameterKind::Const { value })
    }

    pub fn add_double(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(name, ParameterKind::Double { low, high })
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.push(name, ParameterKind::Int { low, high })
    }

    pub fn add_log(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(name, ParameterKind::Log { low, high })
    }

    pub fn add_categorical(self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.push(name, ParameterKind::Categorical { values })
    }

    /// Total number of grid points, given the step count used for continuous
    /// dimensions. `None` on overflow.
    pub fn grid_size(&self, float_steps: usize) -> Option<usize> {
        let mut total: usize = 1;
        for param in &self.parameters {
            let dim_size = match &param.kind {
                ParameterKind::Const { .. } => 1,
                ParameterKind::Int { low, high } => (high - low + 1).max(0) as usize,
                ParameterKind::Categorical { values } => values.len(),
                ParameterKind::Double { .. } | ParameterKind::Log { .. } => float_steps.max(2),
            };
            total = total.checked_mul(dim_size)?;
        }
        Some(total)
    }

    /// Checks that every range is well formed.
    pub fn validate(&self) -> Result<(), String> {
        for param in &self.parameters {
            let ok = match &param.kind {
                ParameterKind::Const { .. } => true,
                ParameterKind::Double { low, high } => low <= high,
                ParameterKind::Int { low, high } => low <= high,
                ParameterKind::Log { low, high } => *low > 0.0 && low <= high,
                ParameterKind::Categorical { values } => !values.is_empty(),
            };
            if !ok {
                return Err(format!("invalid range for hyperparameter {}", param.name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_size_counts_every_dimension() {
        let space = SearchSpace::new()
            .add_int("a", 1, 3)
            .add_categorical("b", vec![serde_json::json!("x"), serde_json::json!("y")])
            .add_const("c", serde_json::json!(1));
        assert_eq!(space.grid_size(5), Some(6));
        assert_eq!(space.clone().add_double("lr", 0.1, 0.2).grid_size(4), Some(24));
    }

    #[test]
    fn validate_rejects_bad_ranges() {
        assert!(SearchSpace::new().add_int("a", 3, 1).validate().is_err());
        assert!(SearchSpace::new().add_log("lr", 0.0, 1.0).validate().is_err());
        assert!(SearchSpace::new().add_categorical("c", vec![]).validate().is_err());
        assert!(SearchSpace::new().add_double("d", 0.0, 1.0).validate().is_ok());
    }

    #[test]
    fn parameter_kind_is_tagged() {
        let json = serde_json::to_value(ParameterKind::Int { low: 1, high: 2 }).unwrap();
        assert_eq!(json["type"], "int");
    }
}
