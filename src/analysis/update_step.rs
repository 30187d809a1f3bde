//! Update steps: which observations condition which parameters.

use serde::{Deserialize, Serialize};

use super::observation::ObservationSet;
use crate::error::{EnsembleResult, ValidationError};
use crate::parameter::EnsembleConfig;

/// Name of the step built by [`UpdateConfiguration::all_active`].
pub const ALL_ACTIVE_STEP: &str = "ALL_ACTIVE";

/// A parameter taking part in a step, optionally localized to a subset
/// of its values.
///
/// With row scaling, row `i` of the selection moves `row_scaling[i]` of the
/// way from its prior value to the analysed value: `0` keeps the prior and
/// `1` takes the full update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSelection {
    /// Parameter key.
    pub key: String,
    /// Value indices to update; `None` updates every value.
    #[serde(default)]
    pub index: Option<Vec<usize>>,
    /// One factor in `[0, 1]` per selected row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_scaling: Option<Vec<f64>>,
}

impl ParameterSelection {
    /// Select every value of `key`.
    pub fn all(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            index: None,
            row_scaling: None,
        }
    }

    /// Select only `index` of `key`.
    pub fn subset(key: impl Into<String>, index: Vec<usize>) -> Self {
        Self {
            key: key.into(),
            index: Some(index),
            row_scaling: None,
        }
    }

    /// Scale the update of each selected row.
    #[must_use]
    pub fn with_row_scaling(mut self, factors: Vec<f64>) -> Self {
        self.row_scaling = Some(factors);
        self
    }

    /// Scaling factor of the `i`-th selected row.
    #[must_use]
    pub fn scale(&self, i: usize) -> f64 {
        self.row_scaling.as_ref().and_then(|f| f.get(i).copied()).unwrap_or(1.0)
    }

    fn validate(&self, size: usize) -> Result<(), ValidationError> {
        if let Some(index) = &self.index {
            if let Some(&bad) = index.iter().find(|&&i| i >= size) {
                return Err(ValidationError::LocalizationOutOfRange {
                    key: self.key.clone(),
                    index: bad,
                    size,
                });
            }
        }
        if let Some(factors) = &self.row_scaling {
            let expected = self.index.as_ref().map_or(size, Vec::len);
            if factors.len() != expected {
                return Err(ValidationError::ValueCountMismatch {
                    key: format!("{} row scaling", self.key),
                    expected,
                    actual: factors.len(),
                });
            }
            if factors.iter().any(|f| !(0.0..=1.0).contains(f)) {
                return Err(ValidationError::InvalidConfig {
                    field: format!("{}.row_scaling", self.key),
                    reason: "factors must lie in [0, 1]".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Rows of a parameter of `size` values this selection updates.
    #[must_use]
    pub fn rows(&self, size: usize) -> Vec<usize> {
        self.index.clone().unwrap_or_else(|| (0..size).collect())
    }
}

/// A named grouping of observations and parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStep {
    /// Step name; appears in snapshots and errors.
    pub name: String,
    /// Observation keys.
    pub observations: Vec<String>,
    /// Parameters updated by this step.
    pub parameters: Vec<ParameterSelection>,
}

impl UpdateStep {
    /// A step with no observations or parameters yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            observations: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Add an observation key.
    #[must_use]
    pub fn with_observation(mut self, key: impl Into<String>) -> Self {
        self.observations.push(key.into());
        self
    }

    /// Add a parameter selection.
    #[must_use]
    pub fn with_parameter(mut self, selection: ParameterSelection) -> Self {
        self.parameters.push(selection);
        self
    }
}

/// Ordered update steps applied by one smoother update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateConfiguration {
    steps: Vec<UpdateStep>,
}

impl UpdateConfiguration {
    /// Configuration from explicit steps.
    #[must_use]
    pub fn new(steps: Vec<UpdateStep>) -> Self {
        Self { steps }
    }

    /// One step using every observation against every parameter.
    #[must_use]
    pub fn all_active(ensemble: &EnsembleConfig, observations: &ObservationSet) -> Self {
        let step = UpdateStep {
            name: ALL_ACTIVE_STEP.to_string(),
            observations: observations.keys(),
            parameters: ensemble.parameter_keys().into_iter().map(ParameterSelection::all).collect(),
        };
        Self { steps: vec![step] }
    }

    /// Steps in declaration order.
    #[must_use]
    pub fn steps(&self) -> &[UpdateStep] {
        &self.steps
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if there are no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Check every key and localization index against the configuration.
    pub fn validate(&self, ensemble: &EnsembleConfig, observations: &ObservationSet) -> EnsembleResult<()> {
        if self.steps.is_empty() {
            return Err(ValidationError::InvalidConfig {
                field: "update_steps".to_string(),
                reason: "must contain at least one step".to_string(),
            }
            .into());
        }
        for step in &self.steps {
            for key in &step.observations {
                observations.get(key)?;
            }
            for selection in &step.parameters {
                let size = ensemble.parameter(&selection.key)?.size();
                selection.validate(size)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Observation;
    use crate::parameter::{ParameterConfig, ParameterKind};

    fn ensemble() -> EnsembleConfig {
        EnsembleConfig::new()
            .with_parameter(ParameterConfig::new("PORO", ParameterKind::Field { size: 4 }))
            .unwrap()
            .with_response("FOPR")
    }

    fn observations() -> ObservationSet {
        ObservationSet::new()
            .with(Observation::new("FOPR_0", "FOPR", 0, vec![1.0], vec![0.1]))
            .unwrap()
    }

    #[test]
    fn test_all_active_covers_everything() {
        let config = UpdateConfiguration::all_active(&ensemble(), &observations());
        assert_eq!(config.len(), 1);
        let step = &config.steps()[0];
        assert_eq!(step.name, ALL_ACTIVE_STEP);
        assert_eq!(step.observations, vec!["FOPR_0".to_string()]);
        assert_eq!(step.parameters, vec![ParameterSelection::all("PORO")]);
        config.validate(&ensemble(), &observations()).unwrap();
    }

    #[test]
    fn test_localization_out_of_range() {
        let config = UpdateConfiguration::new(vec![UpdateStep::new("local")
            .with_observation("FOPR_0")
            .with_parameter(ParameterSelection::subset("PORO", vec![1, 4]))]);
        let err = config.validate(&ensemble(), &observations()).unwrap_err();
        assert!(err.to_string().contains("index 4"));
    }

    #[test]
    fn test_unknown_keys_are_configuration_errors() {
        let config = UpdateConfiguration::new(vec![UpdateStep::new("s").with_observation("MISSING")]);
        assert!(config.validate(&ensemble(), &observations()).unwrap_err().is_configuration());

        let config = UpdateConfiguration::new(vec![UpdateStep::new("s")
            .with_observation("FOPR_0")
            .with_parameter(ParameterSelection::all("PERM"))]);
        assert!(config.validate(&ensemble(), &observations()).unwrap_err().is_configuration());
    }

    #[test]
    fn test_empty_configuration_rejected() {
        assert!(UpdateConfiguration::new(vec![])
            .validate(&ensemble(), &observations())
            .is_err());
    }

    #[test]
    fn test_row_scaling_checked() {
        let step = |selection| {
            UpdateConfiguration::new(vec![UpdateStep::new("scaled")
                .with_observation("FOPR_0")
                .with_parameter(selection)])
        };
        let ok = ParameterSelection::subset("PORO", vec![0, 3]).with_row_scaling(vec![0.25, 1.0]);
        assert!((ok.scale(0) - 0.25).abs() < f64::EPSILON);
        assert!((ParameterSelection::all("PORO").scale(2) - 1.0).abs() < f64::EPSILON);
        step(ok).validate(&ensemble(), &observations()).unwrap();

        let short = ParameterSelection::all("PORO").with_row_scaling(vec![0.5; 3]);
        let err = step(short).validate(&ensemble(), &observations()).unwrap_err();
        assert!(err.to_string().contains("expects 4 values, got 3"), "{err}");

        let out_of_range = ParameterSelection::subset("PORO", vec![1]).with_row_scaling(vec![1.5]);
        assert!(step(out_of_range).validate(&ensemble(), &observations()).is_err());
    }

    #[test]
    fn test_selection_rows() {
        assert_eq!(ParameterSelection::all("P").rows(3), vec![0, 1, 2]);
        assert_eq!(ParameterSelection::subset("P", vec![2]).rows(3), vec![2]);
    }
}
