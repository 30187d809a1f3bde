//! Analysis modules: the numerical update transform.
//!
//! The orchestrator treats the module as a black box: it receives the
//! prior parameter rows selected by one update step plus the screened
//! observations, and returns posterior rows of the same shape with the
//! realization (column) order preserved.
//!
//! [`EnsembleSmoother`] is stateless. [`IterativeEnsembleSmoother`] keeps
//! its coefficient matrix between rounds, so the caller owns one instance
//! per experiment and passes it to every iteration.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, Axis};
use serde_json::Value;

use super::linalg::{solve, solve_spd};

/// Everything an analysis module sees for one update step.
///
/// Columns of `prior`, `responses` and `noise` are the realizations with
/// data, in ascending realization order.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisInput<'a> {
    /// Prior parameter rows selected by the step (parameters x realizations).
    pub prior: &'a Array2<f64>,
    /// Simulated values of the active observations (observations x realizations).
    pub responses: &'a Array2<f64>,
    /// Observed values of the active observations.
    pub observation_values: &'a Array1<f64>,
    /// Scaled observation errors (standard deviations).
    pub observation_errors: &'a Array1<f64>,
    /// Standard-normal draws (observations x realizations) for perturbing
    /// observations.
    pub noise: &'a Array2<f64>,
    /// One entry per realization of the full ensemble; `true` entries are
    /// the columns above.
    pub ensemble_mask: &'a [bool],
    /// One entry per observation point of the step; `true` entries are the
    /// rows above.
    pub observation_mask: &'a [bool],
}

impl AnalysisInput<'_> {
    fn check(&self) -> Result<(usize, usize), String> {
        let s = self.responses;
        let (m, n) = s.dim();
        if n < 2 {
            return Err(format!("needs at least 2 realizations, got {n}"));
        }
        if self.prior.ncols() != n
            || self.observation_values.len() != m
            || self.observation_errors.len() != m
            || self.noise.dim() != (m, n)
        {
            return Err("observation inputs do not match the response matrix".to_string());
        }
        if self.ensemble_mask.iter().filter(|&&a| a).count() != n {
            return Err(format!("ensemble mask does not select {n} realizations"));
        }
        if self.observation_mask.iter().filter(|&&a| a).count() != m {
            return Err(format!("observation mask does not select {m} observations"));
        }
        Ok((m, n))
    }

    /// Perturbed observations minus responses: `d + E - S`.
    fn innovation(&self, perturbation: &Array2<f64>) -> Array2<f64> {
        let d = perturbation + &self.observation_values.view().insert_axis(Axis(1));
        &d - self.responses
    }
}

/// Update transform interface.
pub trait AnalysisModule {
    /// Module name (recorded in snapshots).
    fn name(&self) -> &str;

    /// Module settings recorded in snapshots.
    fn configuration(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    /// Returns true if the module carries state from one update round to
    /// the next. Such modules accept a single update step only.
    fn is_iterative(&self) -> bool {
        false
    }

    /// Compute posterior rows; must return a matrix shaped like `input.prior`.
    fn update(&mut self, input: &AnalysisInput<'_>) -> Result<Array2<f64>, String>;
}

/// Stochastic ensemble smoother with perturbed observations.
///
/// `posterior = prior + A' S'ᵀ (S' S'ᵀ + (N-1) R)⁻¹ (D - S)` where primes
/// are ensemble anomalies, `R` is the diagonal error covariance and `D`
/// the perturbed observations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnsembleSmoother {
    /// Added to the diagonal before inversion.
    pub ridge: f64,
}

impl Default for EnsembleSmoother {
    fn default() -> Self {
        Self { ridge: 0.0 }
    }
}

fn anomalies(m: &Array2<f64>) -> Array2<f64> {
    match m.mean_axis(Axis(1)) {
        Some(mean) => m - &mean.insert_axis(Axis(1)),
        None => m.clone(),
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_f64(n: usize) -> f64 {
    n as f64
}

impl AnalysisModule for EnsembleSmoother {
    fn name(&self) -> &str {
        "STD_ENKF"
    }

    fn configuration(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([("ridge".to_string(), Value::from(self.ridge))])
    }

    fn update(&mut self, input: &AnalysisInput<'_>) -> Result<Array2<f64>, String> {
        let (m, n) = input.check()?;
        let errors = input.observation_errors;
        let perturbation = input.noise * &errors.view().insert_axis(Axis(1));
        let innovation = input.innovation(&perturbation);

        let s_anom = anomalies(input.responses);
        let scale = as_f64(n - 1);
        let mut c = s_anom.dot(&s_anom.t());
        for i in 0..m {
            c[[i, i]] += scale * errors[i] * errors[i] + self.ridge;
        }

        let w = solve_spd(&c, &innovation)?;
        let a_anom = anomalies(input.prior);
        Ok(input.prior + &a_anom.dot(&s_anom.t()).dot(&w))
    }
}

/// State an [`IterativeEnsembleSmoother`] carries between rounds.
///
/// Columns are realizations of the full ensemble.
#[derive(Debug, Clone, PartialEq)]
struct IterationState {
    /// Next iteration number, starting at 1.
    iteration: usize,
    /// Ensemble coefficient matrix `W` (realizations x realizations).
    coefficients: Array2<f64>,
    /// Parameter rows seen in the first iteration.
    initial: Option<Array2<f64>>,
    /// Observation noise per observation point and realization, fixed the
    /// first time the point is active.
    noise: Option<Array2<f64>>,
}

/// Iterative ensemble smoother in ensemble-subspace form.
///
/// Each round solves for the coefficient matrix `W` of a Gauss-Newton
/// step and returns `X₀ (I + W / √(N-1))`, where `X₀` is the parameter
/// ensemble of the first round. The step length decays from
/// `max_steplength` towards `min_steplength`:
/// `γᵢ = min + (max - min) · 2^(-(i-1)/(dec-1))`.
///
/// Realizations may drop out between rounds, never join. Perturbations of
/// each observation are drawn once and reused so every round targets the
/// same perturbed data.
#[derive(Debug, Clone, PartialEq)]
pub struct IterativeEnsembleSmoother {
    /// Step length of the first iteration.
    pub max_steplength: f64,
    /// Step length approached in later iterations.
    pub min_steplength: f64,
    /// Decline rate of the step length; must exceed 1.
    pub dec_steplength: f64,
    state: IterationState,
}

impl IterativeEnsembleSmoother {
    /// A fresh smoother for an ensemble of `ensemble_size` realizations.
    #[must_use]
    pub fn new(ensemble_size: usize) -> Self {
        Self {
            max_steplength: 0.6,
            min_steplength: 0.3,
            dec_steplength: 2.5,
            state: IterationState {
                iteration: 1,
                coefficients: Array2::zeros((ensemble_size, ensemble_size)),
                initial: None,
                noise: None,
            },
        }
    }

    /// Override the step length schedule.
    #[must_use]
    pub fn with_steplength(mut self, max: f64, min: f64, dec: f64) -> Self {
        self.max_steplength = max;
        self.min_steplength = min;
        self.dec_steplength = dec;
        self
    }

    /// Number of the next iteration, starting at 1.
    #[must_use]
    pub const fn iteration(&self) -> usize {
        self.state.iteration
    }

    /// Ensemble size this smoother was built for.
    #[must_use]
    pub fn ensemble_size(&self) -> usize {
        self.state.coefficients.nrows()
    }

    /// Current coefficient matrix over the full ensemble.
    #[must_use]
    pub const fn coefficients(&self) -> &Array2<f64> {
        &self.state.coefficients
    }

    /// Step length used by `iteration`.
    #[must_use]
    pub fn steplength(&self, iteration: usize) -> f64 {
        let exponent = -as_f64(iteration.saturating_sub(1)) / (self.dec_steplength - 1.0);
        self.min_steplength + (self.max_steplength - self.min_steplength) * 2f64.powf(exponent)
    }

    /// Prior of the first round for `columns`, remembering it on the first call.
    fn initial_prior(&mut self, prior: &Array2<f64>, columns: &[usize]) -> Result<Array2<f64>, String> {
        let n0 = self.ensemble_size();
        let first = self.state.iteration == 1;
        let stored = self
            .state
            .initial
            .get_or_insert_with(|| Array2::from_elem((prior.nrows(), n0), f64::NAN));
        if stored.nrows() != prior.nrows() {
            return Err(format!(
                "parameter rows changed between iterations: {} then {}",
                stored.nrows(),
                prior.nrows()
            ));
        }
        if first {
            for (j, &col) in columns.iter().enumerate() {
                stored.column_mut(col).assign(&prior.column(j));
            }
        } else if let Some(&col) = columns.iter().find(|&&col| stored.column(col).iter().any(|v| v.is_nan())) {
            return Err(format!("realization {col} was not part of the first iteration"));
        }
        Ok(Array2::from_shape_fn((prior.nrows(), columns.len()), |(i, j)| {
            stored[[i, columns[j]]]
        }))
    }

    /// Perturbations `E` for the active rows and columns.
    fn perturbation(&mut self, input: &AnalysisInput<'_>, rows: &[usize], columns: &[usize]) -> Result<Array2<f64>, String> {
        let n0 = self.ensemble_size();
        let total = input.observation_mask.len();
        let stored = self
            .state
            .noise
            .get_or_insert_with(|| Array2::from_elem((total, n0), f64::NAN));
        if stored.nrows() != total {
            return Err(format!(
                "observation points changed between iterations: {} then {total}",
                stored.nrows()
            ));
        }
        let errors = input.observation_errors;
        Ok(Array2::from_shape_fn((rows.len(), columns.len()), |(r, j)| {
            let cell = &mut stored[[rows[r], columns[j]]];
            if cell.is_nan() {
                *cell = input.noise[[r, j]];
            }
            *cell * errors[r]
        }))
    }
}

fn selected(mask: &[bool]) -> Vec<usize> {
    mask.iter().enumerate().filter(|(_, &a)| a).map(|(i, _)| i).collect()
}

impl AnalysisModule for IterativeEnsembleSmoother {
    fn name(&self) -> &str {
        "IES_ENKF"
    }

    fn configuration(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("iteration".to_string(), Value::from(self.state.iteration)),
            ("max_steplength".to_string(), Value::from(self.max_steplength)),
            ("min_steplength".to_string(), Value::from(self.min_steplength)),
            ("dec_steplength".to_string(), Value::from(self.dec_steplength)),
        ])
    }

    fn is_iterative(&self) -> bool {
        true
    }

    fn update(&mut self, input: &AnalysisInput<'_>) -> Result<Array2<f64>, String> {
        let (m, n) = input.check()?;
        if input.ensemble_mask.len() != self.ensemble_size() {
            return Err(format!(
                "ensemble mask has {} entries, smoother was built for {}",
                input.ensemble_mask.len(),
                self.ensemble_size()
            ));
        }
        let columns = selected(input.ensemble_mask);
        let rows = selected(input.observation_mask);

        let x0 = self.initial_prior(input.prior, &columns)?;
        let perturbation = self.perturbation(input, &rows, &columns)?;
        let w0 = Array2::from_shape_fn((n, n), |(i, j)| self.state.coefficients[[columns[i], columns[j]]]);

        let root = as_f64(n - 1).sqrt();
        let centering = Array2::from_shape_fn((n, n), |(i, j)| {
            let identity = if i == j { 1.0 } else { 0.0 };
            (identity - 1.0 / as_f64(n)) / root
        });
        let y = input.responses.dot(&centering);
        let omega = Array2::<f64>::eye(n) + w0.dot(&centering);
        // Average sensitivity: S Ω = Y, solved as Ωᵀ Sᵀ = Yᵀ.
        let s = solve(&omega.t().to_owned(), &y.t().to_owned())?.reversed_axes();

        let h = s.dot(&w0) + input.innovation(&perturbation);
        let mut c = s.dot(&s.t());
        for i in 0..m {
            c[[i, i]] += input.observation_errors[i] * input.observation_errors[i];
        }
        let gain = s.t().dot(&solve_spd(&c, &h)?);

        let gamma = self.steplength(self.state.iteration);
        let w = &w0 - &((&w0 - &gain) * gamma);
        for (i, &ci) in columns.iter().enumerate() {
            for (j, &cj) in columns.iter().enumerate() {
                self.state.coefficients[[ci, cj]] = w[[i, j]];
            }
        }
        self.state.iteration += 1;

        Ok(x0.dot(&(Array2::<f64>::eye(n) + &w / root)))
    }
}
