//! Observations: measured data the update conditions on.
//!
//! An observation points at one response vector at one report step and
//! lists the positions within it that were measured, each with a value
//! and a standard deviation.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, EnsembleError, ValidationError};
use crate::parameter::EnsembleConfig;

/// One observation of a response at one report step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Observation key, unique within an [`ObservationSet`].
    pub key: String,
    /// Response the observation measures.
    pub response_key: String,
    /// Report step of the measured response vector.
    #[serde(default)]
    pub report_step: usize,
    /// Positions in the response vector; defaults to `0..values.len()`.
    #[serde(default)]
    pub index: Vec<usize>,
    /// Observed values.
    pub values: Vec<f64>,
    /// Standard deviations of the observed values.
    pub errors: Vec<f64>,
}

impl Observation {
    /// Observation of `response_key` at `report_step` covering the first
    /// `values.len()` response positions.
    pub fn new(
        key: impl Into<String>,
        response_key: impl Into<String>,
        report_step: usize,
        values: Vec<f64>,
        errors: Vec<f64>,
    ) -> Self {
        Self {
            key: key.into(),
            response_key: response_key.into(),
            report_step,
            index: Vec::new(),
            values,
            errors,
        }
    }

    /// Measure explicit response positions instead of the leading ones.
    #[must_use]
    pub fn with_index(mut self, index: Vec<usize>) -> Self {
        self.index = index;
        self
    }

    /// Number of measured data points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing was measured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Response position of data point `i`.
    #[must_use]
    pub fn response_index(&self, i: usize) -> usize {
        self.index.get(i).copied().unwrap_or(i)
    }

    /// Display name of data point `i`: the key, or `key[pos]` when the
    /// observation has more than one point.
    #[must_use]
    pub fn point_name(&self, i: usize) -> String {
        if self.len() == 1 {
            self.key.clone()
        } else {
            format!("{}[{}]", self.key, self.response_index(i))
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidConfig {
            field: format!("observation '{}'", self.key),
            reason,
        };
        if self.key.trim().is_empty() {
            return Err(ValidationError::InvalidConfig {
                field: "observation".to_string(),
                reason: "key must not be empty".to_string(),
            });
        }
        if self.values.is_empty() {
            return Err(invalid("has no values".to_string()));
        }
        if self.errors.len() != self.values.len() {
            return Err(invalid(format!(
                "has {} values but {} errors",
                self.values.len(),
                self.errors.len()
            )));
        }
        if !self.index.is_empty() && self.index.len() != self.values.len() {
            return Err(invalid(format!(
                "has {} values but {} index entries",
                self.values.len(),
                self.index.len()
            )));
        }
        if let Some(v) = self.values.iter().find(|v| !v.is_finite()) {
            return Err(invalid(format!("value {v} is not finite")));
        }
        if let Some(e) = self.errors.iter().find(|e| !e.is_finite() || **e <= 0.0) {
            return Err(invalid(format!("error {e} must be positive and finite")));
        }
        Ok(())
    }
}

/// All observations of an experiment, keyed by observation key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationSet {
    observations: BTreeMap<String, Observation>,
}

impl ObservationSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observation; keys must be unique.
    pub fn add(&mut self, observation: Observation) -> Result<(), ValidationError> {
        observation.validate()?;
        if self.observations.contains_key(&observation.key) {
            return Err(ValidationError::InvalidConfig {
                field: format!("observation '{}'", observation.key),
                reason: "declared twice".to_string(),
            });
        }
        self.observations.insert(observation.key.clone(), observation);
        Ok(())
    }

    /// Builder form of [`Self::add`].
    pub fn with(mut self, observation: Observation) -> Result<Self, ValidationError> {
        self.add(observation)?;
        Ok(self)
    }

    /// Look up an observation.
    pub fn get(&self, key: &str) -> Result<&Observation, ConfigurationError> {
        self.observations
            .get(key)
            .ok_or_else(|| ConfigurationError::UnknownObservation { key: key.to_string() })
    }

    /// Returns true if `key` is a known observation.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.observations.contains_key(key)
    }

    /// Observation keys in sorted order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.observations.keys().cloned().collect()
    }

    /// Number of observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Returns true if there are no observations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Iterate observations in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.observations.values()
    }

    /// Check that every observation measures a declared response.
    pub fn check_responses(&self, ensemble: &EnsembleConfig) -> Result<(), ConfigurationError> {
        for obs in self.iter() {
            if !ensemble.has_response(&obs.response_key) {
                return Err(ConfigurationError::UnknownResponse {
                    key: obs.response_key.clone(),
                });
            }
        }
        Ok(())
    }

    /// Read a JSON list of observations.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EnsembleError> {
        let path = path.as_ref();
        let unreadable = |reason: String| ConfigurationError::Unreadable {
            path: path.to_path_buf(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        let list: Vec<Observation> = serde_json::from_str(&text).map_err(|e| unreadable(e.to_string()))?;
        let mut set = Self::new();
        for obs in list {
            set.add(obs)?;
        }
        Ok(set)
    }
}
