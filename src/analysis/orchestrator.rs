//! Smoother update orchestration.
//!
//! One update reads the prior from a source case and writes the posterior
//! into a target case:
//!
//! 1. Realizations with data in the source are selected; too few is fatal.
//! 2. Every parameter with data is loaded into a prior matrix per key.
//! 3. Each step, in declaration order and always against the prior,
//!    screens its observations, draws the observation noise, runs the
//!    analysis module on the localized rows and scatters the result into
//!    the posterior. A later step overwrites rows an earlier one updated.
//! 4. The posterior is written for the same realizations; rows no step
//!    touched are copied unchanged.
//!
//! A failing step is recorded in the snapshot and the others proceed. If
//! every step fails, the first error is returned and nothing is written.
//!
//! An iterative module keeps state across rounds and is limited to a
//! single update step.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::StandardNormal;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::module::{AnalysisInput, AnalysisModule};
use super::observation::ObservationSet;
use super::screening::{ensemble_moments, Screening};
use super::snapshot::{ObservationRecord, StepSnapshot, UpdateSnapshot};
use super::update_step::{ParameterSelection, UpdateConfiguration, UpdateStep};
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, EnsembleError, EnsembleResult, FileSystemError, ValidationError};
use crate::parameter::EnsembleConfig;
use crate::realization::RealizationState;
use crate::run::RunId;
use crate::storage::CaseStore;

/// Inputs of one smoother update.
#[derive(Clone, Copy)]
pub struct SmootherUpdate<'a> {
    /// Case holding the prior and the simulated responses.
    pub source: &'a CaseStore,
    /// Case receiving the posterior.
    pub target: &'a CaseStore,
    /// Parameter and response declarations.
    pub ensemble: &'a EnsembleConfig,
    /// Observations referenced by the steps.
    pub observations: &'a ObservationSet,
    /// Steps to apply.
    pub steps: &'a UpdateConfiguration,
    /// Screening and realization thresholds.
    pub config: &'a AnalysisConfig,
}

impl std::fmt::Debug for SmootherUpdate<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmootherUpdate")
            .field("source", &self.source.name())
            .field("target", &self.target.name())
            .field("steps", &self.steps.len())
            .finish_non_exhaustive()
    }
}

/// Observations of one step that survived screening.
struct ScreenedObservations {
    responses: Array2<f64>,
    values: Array1<f64>,
    errors: Array1<f64>,
    /// Status of every observation point of the step.
    mask: Vec<bool>,
}

/// Per-round inputs shared by every step.
struct StepScope<'s> {
    prior: &'s BTreeMap<String, Array2<f64>>,
    realizations: &'s [usize],
    has_data: &'s [bool],
    screening: &'s Screening,
}

impl SmootherUpdate<'_> {
    /// Run the update through `module`, drawing observation noise from `rng`.
    pub fn run<R: Rng + ?Sized>(
        &self,
        module: &mut dyn AnalysisModule,
        run_id: RunId,
        rng: &mut R,
    ) -> EnsembleResult<UpdateSnapshot> {
        self.steps.validate(self.ensemble, self.observations)?;
        if module.is_iterative() && self.steps.len() > 1 {
            return Err(AnalysisError::IterativeMultiStep {
                module: module.name().to_string(),
                steps: self.steps.len(),
            }
            .into());
        }
        if self.target.ensemble_size() != self.source.ensemble_size() {
            return Err(FileSystemError::EnsembleSizeMismatch {
                case: self.target.name().to_string(),
                found: self.target.ensemble_size(),
                expected: self.source.ensemble_size(),
            }
            .into());
        }

        let has_data = self.source.state_map()?.select_matching(RealizationState::HasData);
        let realizations: Vec<usize> = (0..has_data.len()).filter(|&i| has_data[i]).collect();
        let required = self.config.min_realizations.max(1);
        if realizations.len() < required {
            return Err(AnalysisError::NotEnoughRealizations {
                active: realizations.len(),
                required,
            }
            .into());
        }

        let prior = self.load_prior(&realizations)?;
        let mut posterior = prior.clone();
        let screening = Screening::from(self.config);
        let analysis_configuration = module.configuration();

        let mut steps = Vec::with_capacity(self.steps.len());
        let mut first_error: Option<EnsembleError> = None;
        for step in self.steps.steps() {
            let mut record = StepSnapshot {
                name: step.name.clone(),
                ..StepSnapshot::default()
            };
            let scope = StepScope {
                prior: &prior,
                realizations: &realizations,
                has_data: &has_data,
                screening: &screening,
            };
            match self.run_step(step, &scope, &mut posterior, &mut *module, &mut *rng, &mut record) {
                Ok(()) => {
                    info!(
                        step = %step.name,
                        active_observations = record.active_count(),
                        parameters = record.updated_parameters.len(),
                        "update step finished"
                    );
                }
                Err(EnsembleError::Analysis(err)) => {
                    warn!(step = %step.name, error = %err, "update step failed");
                    record.error = Some(err.to_string());
                    first_error.get_or_insert(err.into());
                }
                Err(other) => return Err(other),
            }
            steps.push(record);
        }

        if steps.iter().all(StepSnapshot::failed) {
            return Err(first_error.unwrap_or_else(|| EnsembleError::internal("update ran no steps")));
        }

        self.write_posterior(&posterior, &realizations, &has_data)?;

        info!(
            source = %self.source.name(),
            target = %self.target.name(),
            realizations = realizations.len(),
            steps = steps.len(),
            failed_steps = steps.iter().filter(|s| s.failed()).count(),
            "smoother update written"
        );

        Ok(UpdateSnapshot {
            run_id,
            source_case: self.source.name().to_string(),
            target_case: self.target.name().to_string(),
            analysis_module: module.name().to_string(),
            analysis_configuration,
            alpha: self.config.alpha,
            std_cutoff: self.config.std_cutoff,
            global_std_scaling: self.config.global_std_scaling,
            realizations,
            created_at: Utc::now(),
            steps,
        })
    }

    /// Load every parameter that has data for all `realizations`.
    ///
    /// A parameter some step updates must be present; others without data
    /// are left out of the posterior. Stored values must match the declared
    /// parameter size.
    fn load_prior(&self, realizations: &[usize]) -> EnsembleResult<BTreeMap<String, Array2<f64>>> {
        let referenced: BTreeSet<&str> = self
            .steps
            .steps()
            .iter()
            .flat_map(|s| s.parameters.iter().map(|p| p.key.as_str()))
            .collect();

        let mut prior = BTreeMap::new();
        for param in self.ensemble.parameters() {
            let missing = realizations
                .iter()
                .copied()
                .find(|&iens| !self.source.has_parameter(&param.key, iens));
            if let Some(realization) = missing {
                if referenced.contains(param.key.as_str()) {
                    return Err(AnalysisError::MissingParameter {
                        key: param.key.clone(),
                        realization,
                    }
                    .into());
                }
                debug!(key = %param.key, realization, "parameter without data left out of update");
                continue;
            }
            let matrix = self.source.load_parameter_matrix(&param.key, realizations)?;
            if matrix.nrows() != param.size() {
                return Err(AnalysisError::ParameterSizeMismatch {
                    key: param.key.clone(),
                    expected: param.size(),
                    actual: matrix.nrows(),
                }
                .into());
            }
            prior.insert(param.key.clone(), matrix);
        }
        Ok(prior)
    }

    fn screen(
        &self,
        step: &UpdateStep,
        realizations: &[usize],
        screening: &Screening,
        record: &mut StepSnapshot,
    ) -> EnsembleResult<ScreenedObservations> {
        let mut rows: Vec<Vec<f64>> = Vec::new();
        let mut values = Vec::new();
        let mut errors = Vec::new();
        let mut mask = Vec::new();

        for key in &step.observations {
            let obs = self.observations.get(key)?;
            let mut simulated = Vec::with_capacity(realizations.len());
            for &iens in realizations {
                if !self.source.has_response(&obs.response_key, iens, obs.report_step) {
                    return Err(AnalysisError::MissingResponse {
                        key: obs.response_key.clone(),
                        step: obs.report_step,
                        realization: iens,
                    }
                    .into());
                }
                simulated.push(self.source.load_response(&obs.response_key, iens, obs.report_step)?);
            }

            for (i, (&value, &error)) in obs.values.iter().zip(&obs.errors).enumerate() {
                let pos = obs.response_index(i);
                let point = simulated
                    .iter()
                    .zip(realizations)
                    .map(|(vector, &iens)| {
                        vector.get(pos).copied().ok_or_else(|| AnalysisError::MissingResponse {
                            key: format!("{}[{pos}]", obs.response_key),
                            step: obs.report_step,
                            realization: iens,
                        })
                    })
                    .collect::<Result<Vec<f64>, _>>()?;

                let (mean, std) = ensemble_moments(&point);
                let status = screening.status(value, error, mean, std);
                let scaled = screening.scaled_error(error);
                let name = obs.point_name(i);
                mask.push(status.is_active());
                if status.is_active() {
                    rows.push(point);
                    values.push(value);
                    errors.push(scaled);
                } else {
                    debug!(step = %step.name, observation = %name, mean, std, "observation deactivated");
                }
                record.observations.push(ObservationRecord {
                    name,
                    key: obs.key.clone(),
                    value,
                    error: scaled,
                    status,
                    response_mean: mean,
                    response_std: std,
                });
            }
        }

        let n = realizations.len();
        let responses = Array2::from_shape_fn((rows.len(), n), |(i, j)| rows[i][j]);
        Ok(ScreenedObservations {
            responses,
            values: Array1::from(values),
            errors: Array1::from(errors),
            mask,
        })
    }

    fn run_step<R: Rng + ?Sized>(
        &self,
        step: &UpdateStep,
        scope: &StepScope<'_>,
        posterior: &mut BTreeMap<String, Array2<f64>>,
        module: &mut dyn AnalysisModule,
        rng: &mut R,
        record: &mut StepSnapshot,
    ) -> EnsembleResult<()> {
        let prior = scope.prior;
        let observed = self.screen(step, scope.realizations, scope.screening, record)?;
        let active = observed.values.len();
        record
            .diagnostics
            .insert("active_observations".to_string(), Value::from(active));
        record.diagnostics.insert(
            "deactivated_observations".to_string(),
            Value::from(record.observations.len() - active),
        );
        if active == 0 {
            return Err(AnalysisError::NoActiveObservations {
                step: step.name.clone(),
            }
            .into());
        }

        let n = scope.realizations.len();
        let noise = Array2::from_shape_fn((active, n), |_| rng.sample::<f64, _>(StandardNormal));

        let mut selected: Vec<(&ParameterSelection, Vec<usize>)> = Vec::new();
        for selection in &step.parameters {
            let Some(matrix) = prior.get(&selection.key) else {
                continue;
            };
            let rows = selection.rows(matrix.nrows());
            if let Some(&bad) = rows.iter().find(|&&row| row >= matrix.nrows()) {
                return Err(ValidationError::LocalizationOutOfRange {
                    key: selection.key.clone(),
                    index: bad,
                    size: matrix.nrows(),
                }
                .into());
            }
            selected.push((selection, rows));
        }
        let total: usize = selected.iter().map(|(_, rows)| rows.len()).sum();
        record
            .diagnostics
            .insert("updated_rows".to_string(), Value::from(total));
        if total == 0 {
            debug!(step = %step.name, "no parameter rows selected");
            return Ok(());
        }

        let mut a = Array2::<f64>::zeros((total, n));
        let mut offset = 0;
        for (selection, rows) in &selected {
            let source = &prior[&selection.key];
            for (i, &row) in rows.iter().enumerate() {
                a.row_mut(offset + i).assign(&source.row(row));
            }
            offset += rows.len();
        }

        let updated = module
            .update(&AnalysisInput {
                prior: &a,
                responses: &observed.responses,
                observation_values: &observed.values,
                observation_errors: &observed.errors,
                noise: &noise,
                ensemble_mask: scope.has_data,
                observation_mask: &observed.mask,
            })
            .map_err(|reason| AnalysisError::ModuleFailed {
                step: step.name.clone(),
                reason,
            })?;

        if updated.dim() != a.dim() {
            return Err(AnalysisError::ShapeMismatch {
                step: step.name.clone(),
                expected_rows: a.nrows(),
                expected_cols: a.ncols(),
                actual_rows: updated.nrows(),
                actual_cols: updated.ncols(),
            }
            .into());
        }
        if updated.iter().any(|v| !v.is_finite()) {
            return Err(AnalysisError::ModuleFailed {
                step: step.name.clone(),
                reason: "result contains non-finite values".to_string(),
            }
            .into());
        }

        let mut offset = 0;
        for (selection, rows) in selected {
            if let Some(target) = posterior.get_mut(&selection.key) {
                for (i, &row) in rows.iter().enumerate() {
                    let analysed = updated.row(offset + i);
                    let scale = selection.scale(i);
                    if scale < 1.0 {
                        let before = a.row(offset + i);
                        target.row_mut(row).assign(&(&before + &((&analysed - &before) * scale)));
                    } else {
                        target.row_mut(row).assign(&analysed);
                    }
                }
            }
            offset += rows.len();
            record.updated_parameters.push(selection.key.clone());
        }
        Ok(())
    }

    fn write_posterior(
        &self,
        posterior: &BTreeMap<String, Array2<f64>>,
        realizations: &[usize],
        has_data: &[bool],
    ) -> EnsembleResult<()> {
        for (key, matrix) in posterior {
            self.target.save_parameter_matrix(key, realizations, matrix)?;
        }
        let parent_failures = self.target.modify_state_map(|map| {
            let mut failed = 0;
            for (iens, &ok) in has_data.iter().enumerate() {
                if ok {
                    map.advance_to_initialized(iens)?;
                } else if map.set(iens, RealizationState::ParentFailure)? {
                    failed += 1;
                }
            }
            Ok::<usize, ValidationError>(failed)
        })?;
        if parent_failures > 0 {
            debug!(target = %self.target.name(), parent_failures, "marked realizations without parent data");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{EnsembleSmoother, IterativeEnsembleSmoother, Observation, ALL_ACTIVE_STEP};
    use crate::parameter::{ParameterConfig, ParameterKind};
    use crate::sampling::derive_rng;
    use crate::storage::CASE_FORMAT_VERSION;
    use std::path::Path;
    use tempfile::tempdir;

    const N: usize = 6;

    fn ensemble() -> EnsembleConfig {
        EnsembleConfig::new()
            .with_parameter(ParameterConfig::new("P", ParameterKind::Field { size: 3 }))
            .unwrap()
            .with_response("R")
    }

    fn observations(value: f64) -> ObservationSet {
        ObservationSet::new()
            .with(Observation::new("OBS", "R", 0, vec![value], vec![0.5]))
            .unwrap()
    }

    /// Source where realization `i` has P = [i, 10 + i, -i] and R = [i],
    /// with realization 5 left without data.
    fn cases(dir: &Path) -> (CaseStore, CaseStore) {
        let source = CaseStore::create(&dir.join("prior"), "prior", N, CASE_FORMAT_VERSION, false).unwrap();
        let target = CaseStore::create(&dir.join("post"), "post", N, CASE_FORMAT_VERSION, false).unwrap();
        for iens in 0..N {
            #[allow(clippy::cast_precision_loss)]
            let x = iens as f64;
            source.save_parameter("P", iens, &[x, 10.0 + x, -x]).unwrap();
            source.set_state(iens, RealizationState::Initialized).unwrap();
            if iens < N - 1 {
                source.save_response("R", iens, 0, &[x]).unwrap();
                source.set_state(iens, RealizationState::HasData).unwrap();
            }
        }
        (source, target)
    }

    /// Moves every selected row by the sum of the active observed values.
    struct Shift;

    impl AnalysisModule for Shift {
        fn name(&self) -> &str {
            "SHIFT"
        }

        fn update(&mut self, input: &AnalysisInput<'_>) -> Result<Array2<f64>, String> {
            Ok(input.prior + input.observation_values.sum())
        }
    }

    fn run_with(
        module: &mut dyn AnalysisModule,
        source: &CaseStore,
        target: &CaseStore,
        obs: &ObservationSet,
        steps: &UpdateConfiguration,
        config: &AnalysisConfig,
    ) -> EnsembleResult<UpdateSnapshot> {
        let ensemble = ensemble();
        SmootherUpdate {
            source,
            target,
            ensemble: &ensemble,
            observations: obs,
            steps,
            config,
        }
        .run(module, RunId::for_round("prior", Some("post"), 0), &mut derive_rng(7, "update"))
    }

    fn run(
        source: &CaseStore,
        target: &CaseStore,
        obs: &ObservationSet,
        steps: &UpdateConfiguration,
        config: &AnalysisConfig,
    ) -> EnsembleResult<UpdateSnapshot> {
        run_with(&mut EnsembleSmoother::default(), source, target, obs, steps, config)
    }

    #[test]
    fn test_all_active_update() {
        let dir = tempdir().unwrap();
        let (source, target) = cases(dir.path());
        let obs = observations(2.5);
        let steps = UpdateConfiguration::all_active(&ensemble(), &obs);
        let snap = run(&source, &target, &obs, &steps, &AnalysisConfig::default()).unwrap();

        assert_eq!(snap.realizations, vec![0, 1, 2, 3, 4]);
        let step = snap.step(ALL_ACTIVE_STEP).unwrap();
        assert_eq!(step.active_count(), 1);
        assert_eq!(step.updated_parameters, vec!["P".to_string()]);

        let states = target.state_map().unwrap();
        assert_eq!(states.count(RealizationState::Initialized), 5);
        assert_eq!(states.get(5), Some(RealizationState::ParentFailure));
        assert!(!target.has_parameter("P", 5));
        let before = source.load_parameter("P", 0).unwrap();
        let after = target.load_parameter("P", 0).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_localized_rows_untouched() {
        let dir = tempdir().unwrap();
        let (source, target) = cases(dir.path());
        let obs = observations(2.5);
        let steps = UpdateConfiguration::new(vec![UpdateStep::new("local")
            .with_observation("OBS")
            .with_parameter(ParameterSelection::subset("P", vec![1]))]);
        run(&source, &target, &obs, &steps, &AnalysisConfig::default()).unwrap();

        for iens in 0..N - 1 {
            let before = source.load_parameter("P", iens).unwrap();
            let after = target.load_parameter("P", iens).unwrap();
            assert_eq!(before[0].to_bits(), after[0].to_bits());
            assert_eq!(before[2].to_bits(), after[2].to_bits());
        }
    }

    #[test]
    fn test_zero_spread_step_fails_and_writes_nothing() {
        let dir = tempdir().unwrap();
        let (source, target) = cases(dir.path());
        for iens in 0..N - 1 {
            source.save_response("R", iens, 0, &[1.0]).unwrap();
        }
        let obs = observations(1.0);
        let steps = UpdateConfiguration::all_active(&ensemble(), &obs);
        let err = run(&source, &target, &obs, &steps, &AnalysisConfig::default()).unwrap_err();
        assert!(err.is_analysis());
        assert!(err.to_string().contains("No active observations"));
        assert!(!target.has_parameter("P", 0));
        assert_eq!(target.state_map().unwrap().count(RealizationState::Undefined), N);
    }

    #[test]
    fn test_one_failed_step_does_not_stop_others() {
        let dir = tempdir().unwrap();
        let (source, target) = cases(dir.path());
        let obs = observations(2.5)
            .with(Observation::new("FAR", "R", 0, vec![1e6], vec![0.5]))
            .unwrap();
        let steps = UpdateConfiguration::new(vec![
            UpdateStep::new("outlier")
                .with_observation("FAR")
                .with_parameter(ParameterSelection::all("P")),
            UpdateStep::new("good")
                .with_observation("OBS")
                .with_parameter(ParameterSelection::all("P")),
        ]);
        let snap = run(&source, &target, &obs, &steps, &AnalysisConfig::default()).unwrap();
        assert!(snap.step("outlier").unwrap().failed());
        assert!(!snap.step("good").unwrap().failed());
        assert!(target.has_parameter("P", 0));
    }

    #[test]
    fn test_min_realizations() {
        let dir = tempdir().unwrap();
        let (source, target) = cases(dir.path());
        let obs = observations(2.5);
        let steps = UpdateConfiguration::all_active(&ensemble(), &obs);
        let config = AnalysisConfig {
            min_realizations: 6,
            ..AnalysisConfig::default()
        };
        let err = run(&source, &target, &obs, &steps, &config).unwrap_err();
        assert!(matches!(
            err,
            EnsembleError::Analysis(AnalysisError::NotEnoughRealizations { active: 5, required: 6 })
        ));
    }

    #[test]
    fn test_missing_response_fails_step() {
        let dir = tempdir().unwrap();
        let (source, target) = cases(dir.path());
        let obs = ObservationSet::new()
            .with(Observation::new("LATE", "R", 3, vec![1.0], vec![0.5]))
            .unwrap();
        let steps = UpdateConfiguration::all_active(&ensemble(), &obs);
        let err = run(&source, &target, &obs, &steps, &AnalysisConfig::default()).unwrap_err();
        assert!(err.to_string().contains("report step 3"));
    }

    #[test]
    fn test_steps_read_the_prior_and_later_step_wins() {
        let dir = tempdir().unwrap();
        let (source, target) = cases(dir.path());
        let obs = observations(2.5)
            .with(Observation::new("OBS_B", "R", 0, vec![3.0], vec![0.5]))
            .unwrap();
        let steps = UpdateConfiguration::new(vec![
            UpdateStep::new("first")
                .with_observation("OBS")
                .with_parameter(ParameterSelection::subset("P", vec![0, 1])),
            UpdateStep::new("second")
                .with_observation("OBS_B")
                .with_parameter(ParameterSelection::subset("P", vec![1, 2])),
        ]);
        let snap = run_with(&mut Shift, &source, &target, &obs, &steps, &AnalysisConfig::default()).unwrap();
        assert!(snap.steps.iter().all(|s| !s.failed()));

        for iens in 0..N - 1 {
            let before = source.load_parameter("P", iens).unwrap();
            let after = target.load_parameter("P", iens).unwrap();
            assert_eq!(after[0].to_bits(), (before[0] + 2.5).to_bits());
            // Overlap: the second step's value, shifted once from the prior.
            assert_eq!(after[1].to_bits(), (before[1] + 3.0).to_bits());
            assert_eq!(after[2].to_bits(), (before[2] + 3.0).to_bits());
        }

        // Same rows as running the second step on its own.
        let alone_dir = tempdir().unwrap();
        let (alone_source, alone_target) = cases(alone_dir.path());
        let second_only = UpdateConfiguration::new(vec![steps.steps()[1].clone()]);
        run_with(&mut Shift, &alone_source, &alone_target, &obs, &second_only, &AnalysisConfig::default()).unwrap();
        for iens in 0..N - 1 {
            let both = target.load_parameter("P", iens).unwrap();
            let alone = alone_target.load_parameter("P", iens).unwrap();
            assert_eq!(both[1].to_bits(), alone[1].to_bits());
            assert_eq!(both[2].to_bits(), alone[2].to_bits());
        }
    }

    #[test]
    fn test_row_scaling_damps_update() {
        let dir = tempdir().unwrap();
        let (source, target) = cases(dir.path());
        let obs = observations(2.5);
        let steps = UpdateConfiguration::new(vec![UpdateStep::new("scaled")
            .with_observation("OBS")
            .with_parameter(ParameterSelection::all("P").with_row_scaling(vec![0.0, 0.5, 1.0]))]);
        run_with(&mut Shift, &source, &target, &obs, &steps, &AnalysisConfig::default()).unwrap();

        for iens in 0..N - 1 {
            let before = source.load_parameter("P", iens).unwrap();
            let after = target.load_parameter("P", iens).unwrap();
            assert_eq!(after[0].to_bits(), before[0].to_bits());
            assert!((after[1] - (before[1] + 1.25)).abs() < 1e-12);
            assert_eq!(after[2].to_bits(), (before[2] + 2.5).to_bits());
        }
    }

    #[test]
    fn test_stored_size_mismatch_is_error_not_panic() {
        let dir = tempdir().unwrap();
        let (source, target) = cases(dir.path());
        for iens in 0..N {
            source.save_parameter("P", iens, &[1.0, 2.0]).unwrap();
        }
        let obs = observations(2.5);
        let steps = UpdateConfiguration::new(vec![UpdateStep::new("local")
            .with_observation("OBS")
            .with_parameter(ParameterSelection::subset("P", vec![2]))]);
        let err = run(&source, &target, &obs, &steps, &AnalysisConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            EnsembleError::Analysis(AnalysisError::ParameterSizeMismatch { expected: 3, actual: 2, .. })
        ));
        assert!(!target.has_parameter("P", 0));
    }

    #[test]
    fn test_iterative_module_single_step_only() {
        let dir = tempdir().unwrap();
        let (source, target) = cases(dir.path());
        let obs = observations(2.5);
        let steps = UpdateConfiguration::new(vec![
            UpdateStep::new("a").with_observation("OBS").with_parameter(ParameterSelection::all("P")),
            UpdateStep::new("b").with_observation("OBS").with_parameter(ParameterSelection::all("P")),
        ]);
        let mut ies = IterativeEnsembleSmoother::new(N);
        let err = run_with(&mut ies, &source, &target, &obs, &steps, &AnalysisConfig::default()).unwrap_err();
        assert!(err.to_string().contains("multi step"), "{err}");
        assert_eq!(ies.iteration(), 1);
        assert!(!target.has_parameter("P", 0));
    }

    #[test]
    fn test_iterative_module_advances() {
        let dir = tempdir().unwrap();
        let (source, target) = cases(dir.path());
        let obs = observations(2.5);
        let steps = UpdateConfiguration::all_active(&ensemble(), &obs);
        let mut ies = IterativeEnsembleSmoother::new(N);
        let snap = run_with(&mut ies, &source, &target, &obs, &steps, &AnalysisConfig::default()).unwrap();

        assert_eq!(snap.analysis_module, "IES_ENKF");
        assert_eq!(snap.analysis_configuration["iteration"], Value::from(1));
        assert_eq!(ies.iteration(), 2);
        assert_eq!(target.state_map().unwrap().get(5), Some(RealizationState::ParentFailure));
        assert_ne!(source.load_parameter("P", 0).unwrap(), target.load_parameter("P", 0).unwrap());
    }
}
