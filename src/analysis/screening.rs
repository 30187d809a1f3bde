//! Observation screening.
//!
//! Pure functions: no storage access, no randomness. The orchestrator
//! feeds them the simulated ensemble values for each observed data point.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;

/// Whether an observed data point takes part in an update step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObservationStatus {
    /// Used by the analysis.
    Active,
    /// Screened out.
    Deactivated,
}

impl ObservationStatus {
    /// Returns true for [`ObservationStatus::Active`].
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for ObservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("ACTIVE"),
            Self::Deactivated => f.write_str("DEACTIVATED"),
        }
    }
}

/// Thresholds used to screen observations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Screening {
    /// Outlier factor.
    pub alpha: f64,
    /// Spread at or below which a data point is deactivated.
    pub std_cutoff: f64,
    /// Multiplier applied to observation errors.
    pub global_std_scaling: f64,
}

impl From<&AnalysisConfig> for Screening {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            alpha: config.alpha,
            std_cutoff: config.std_cutoff,
            global_std_scaling: config.global_std_scaling,
        }
    }
}

/// Ensemble mean and population standard deviation.
///
/// An empty slice gives `(NaN, 0.0)`.
#[must_use]
pub fn ensemble_moments(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, 0.0);
    }
    #[allow(clippy::cast_precision_loss)]
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

impl Screening {
    /// Observation error after global scaling.
    #[must_use]
    pub fn scaled_error(&self, error: f64) -> f64 {
        error * self.global_std_scaling
    }

    /// Screen one data point given the simulated ensemble mean and spread.
    ///
    /// Zero (or below-cutoff) spread deactivates regardless of alpha.
    #[must_use]
    pub fn status(&self, observed: f64, error: f64, mean: f64, std: f64) -> ObservationStatus {
        if std.is_nan() || std <= self.std_cutoff {
            return ObservationStatus::Deactivated;
        }
        let bound = self.alpha * (std + self.scaled_error(error));
        if (observed - mean).abs() <= bound {
            ObservationStatus::Active
        } else {
            ObservationStatus::Deactivated
        }
    }

    /// Screen one data point against its simulated ensemble values.
    #[must_use]
    pub fn screen(&self, observed: f64, error: f64, simulated: &[f64]) -> ObservationStatus {
        let (mean, std) = ensemble_moments(simulated);
        self.status(observed, error, mean, std)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn screening(alpha: f64) -> Screening {
        Screening {
            alpha,
            std_cutoff: 1e-6,
            global_std_scaling: 1.0,
        }
    }

    #[test]
    fn test_zero_spread_is_deactivated() {
        let s = screening(1e9);
        assert_eq!(s.screen(1.0, 0.5, &[1.0, 1.0, 1.0]), ObservationStatus::Deactivated);
    }

    #[test]
    fn test_spread_at_cutoff_is_deactivated() {
        let s = Screening {
            alpha: 3.0,
            std_cutoff: 0.5,
            global_std_scaling: 1.0,
        };
        assert_eq!(s.status(0.0, 1.0, 0.0, 0.5), ObservationStatus::Deactivated);
        assert_eq!(s.status(0.0, 1.0, 0.0, 0.5001), ObservationStatus::Active);
    }

    #[test]
    fn test_outlier_is_deactivated() {
        let s = screening(2.0);
        // mean 1, std 1; bound = 2 * (1 + 0.5) = 3
        let sim = [0.0, 2.0];
        assert_eq!(s.screen(4.0, 0.5, &sim), ObservationStatus::Active);
        assert_eq!(s.screen(4.1, 0.5, &sim), ObservationStatus::Deactivated);
    }

    #[test]
    fn test_global_scaling_widens_bound() {
        let mut s = screening(1.0);
        let sim = [0.0, 2.0];
        assert_eq!(s.screen(3.0, 0.5, &sim), ObservationStatus::Deactivated);
        s.global_std_scaling = 2.0;
        assert_eq!(s.screen(3.0, 0.5, &sim), ObservationStatus::Active);
    }

    #[test]
    fn test_moments() {
        let (m, s) = ensemble_moments(&[1.0, 3.0]);
        assert!((m - 2.0).abs() < 1e-12);
        assert!((s - 1.0).abs() < 1e-12);
        assert!(ensemble_moments(&[]).0.is_nan());
    }

    proptest! {
        #[test]
        fn prop_increasing_alpha_never_decreases_active(
            points in prop::collection::vec(
                (-100.0f64..100.0, 0.01f64..10.0, prop::collection::vec(-100.0f64..100.0, 2..10)),
                1..20,
            ),
            a1 in 0.01f64..10.0,
            delta in 0.0f64..10.0,
        ) {
            let count = |alpha: f64| {
                let s = screening(alpha);
                points
                    .iter()
                    .filter(|(obs, err, sim)| s.screen(*obs, *err, sim).is_active())
                    .count()
            };
            prop_assert!(count(a1 + delta) >= count(a1));
        }
    }
}
