//! Run context: the realizations of one round and their activation.

use serde::Serialize;

use super::run_arg::{RunArg, RunId, RunStatus};
use super::runpaths::Runpaths;
use crate::error::{EnsembleResult, ExecutionError, ValidationError};

/// One simulation round over an ensemble.
///
/// Holds one [`RunArg`] per realization, active or not, so indices stay
/// stable. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    run_id: RunId,
    iteration: usize,
    source_case: String,
    target_case: Option<String>,
    initial_mask: Vec<bool>,
    mask: Vec<bool>,
    run_args: Vec<RunArg>,
}

impl RunContext {
    /// Build a context for `iteration`.
    ///
    /// `mask` defaults to all-active; its length must equal `ensemble_size`.
    pub fn build(
        runpaths: &Runpaths,
        ensemble_size: usize,
        iteration: usize,
        mask: Option<Vec<bool>>,
        source_case: &str,
        target_case: Option<&str>,
    ) -> EnsembleResult<Self> {
        let mask = mask.unwrap_or_else(|| vec![true; ensemble_size]);
        if mask.len() != ensemble_size {
            return Err(ValidationError::MaskLength {
                actual: mask.len(),
                expected: ensemble_size,
            }
            .into());
        }

        let mut run_args = Vec::with_capacity(ensemble_size);
        for (iens, &active) in mask.iter().enumerate() {
            run_args.push(RunArg::new(
                iens,
                iteration,
                runpaths.runpath(iens, iteration)?,
                runpaths.job_name(iens, iteration)?,
                source_case,
                active,
            ));
        }

        Ok(Self {
            run_id: RunId::for_round(source_case, target_case, iteration),
            iteration,
            source_case: source_case.to_string(),
            target_case: target_case.map(str::to_string),
            initial_mask: mask.clone(),
            mask,
            run_args,
        })
    }

    /// Round id; snapshots of an update from this context are keyed by it.
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Iteration number.
    #[must_use]
    pub const fn iteration(&self) -> usize {
        self.iteration
    }

    /// Number of realizations.
    #[must_use]
    pub fn ensemble_size(&self) -> usize {
        self.mask.len()
    }

    /// Case the round reads from and loads into.
    #[must_use]
    pub fn source_case(&self) -> &str {
        &self.source_case
    }

    /// Case an update writes into.
    #[must_use]
    pub fn target_case(&self) -> Option<&str> {
        self.target_case.as_deref()
    }

    /// Current activation mask.
    #[must_use]
    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    /// All run descriptors, in realization order.
    #[must_use]
    pub fn run_args(&self) -> &[RunArg] {
        &self.run_args
    }

    /// Descriptor of one realization.
    #[must_use]
    pub fn run_arg(&self, realization: usize) -> Option<&RunArg> {
        self.run_args.get(realization)
    }

    /// Returns true if the realization is active; out of range is inactive.
    #[must_use]
    pub fn is_active(&self, realization: usize) -> bool {
        self.mask.get(realization).copied().unwrap_or(false)
    }

    /// Drop a realization from the round.
    pub fn deactivate(&mut self, realization: usize) -> Result<(), ValidationError> {
        let ensemble_size = self.mask.len();
        let slot = self
            .mask
            .get_mut(realization)
            .ok_or(ValidationError::RealizationOutOfRange {
                realization,
                ensemble_size,
            })?;
        *slot = false;
        self.run_args[realization].deactivate();
        Ok(())
    }

    /// Indices of active realizations.
    #[must_use]
    pub fn active_realizations(&self) -> Vec<usize> {
        self.mask
            .iter()
            .enumerate()
            .filter_map(|(i, &active)| active.then_some(i))
            .collect()
    }

    /// Number of active realizations.
    #[must_use]
    pub fn count_active(&self) -> usize {
        self.mask.iter().filter(|&&active| active).count()
    }

    /// Fail if nothing is left to run.
    pub fn ensure_active(&self) -> Result<(), ExecutionError> {
        if self.count_active() == 0 {
            return Err(ExecutionError::NoActiveRealizations {
                iteration: self.iteration,
            });
        }
        Ok(())
    }

    /// Record the outcome of one realization.
    pub fn set_run_status(&mut self, realization: usize, status: RunStatus) -> Result<(), ValidationError> {
        let ensemble_size = self.run_args.len();
        self.run_args
            .get_mut(realization)
            .ok_or(ValidationError::RealizationOutOfRange {
                realization,
                ensemble_size,
            })?
            .set_run_status(status);
        Ok(())
    }

    /// Deactivate every realization whose run or load failed.
    ///
    /// Returns the realizations that were deactivated by this call.
    pub fn deactivate_failed_jobs(&mut self) -> Vec<usize> {
        let failed: Vec<usize> = self
            .run_args
            .iter()
            .filter(|arg| self.mask[arg.realization()] && arg.run_status().is_failure())
            .map(RunArg::realization)
            .collect();
        for &iens in &failed {
            self.mask[iens] = false;
            self.run_args[iens].deactivate();
        }
        failed
    }

    /// Realizations that started active and have since been dropped.
    #[must_use]
    pub fn failed_mask(&self) -> Vec<bool> {
        self.initial_mask
            .iter()
            .zip(&self.mask)
            .map(|(&initial, &now)| initial && !now)
            .collect()
    }

    /// Returns true if any initially active realization was dropped.
    #[must_use]
    pub fn has_failed_realizations(&self) -> bool {
        self.failed_mask().into_iter().any(|f| f)
    }

    /// Number of realizations whose results were loaded.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.run_args
            .iter()
            .filter(|arg| arg.run_status() == RunStatus::LoadSuccess)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunpathConfig;
    use proptest::prelude::*;
    use std::path::Path;

    fn runpaths() -> Runpaths {
        let config = RunpathConfig {
            base_dir: Some(Path::new("/ens").to_path_buf()),
            ..RunpathConfig::default()
        };
        Runpaths::new(&config, Path::new("/ens/storage")).unwrap()
    }

    #[test]
    fn test_default_mask_is_all_active() {
        let ctx = RunContext::build(&runpaths(), 5, 0, None, "default", None).unwrap();
        assert_eq!(ctx.count_active(), 5);
        assert_eq!(ctx.run_args().len(), 5);
        assert_eq!(
            ctx.run_arg(3).unwrap().runpath(),
            Path::new("/ens/simulations/realization-3/iter-0")
        );
    }

    #[test]
    fn test_inactive_keeps_run_arg() {
        let ctx = RunContext::build(&runpaths(), 3, 1, Some(vec![true, false, true]), "default", None).unwrap();
        assert_eq!(ctx.run_args().len(), 3);
        assert!(!ctx.run_arg(1).unwrap().is_active());
        assert_eq!(ctx.active_realizations(), vec![0, 2]);
    }

    #[test]
    fn test_mask_length_checked() {
        let err = RunContext::build(&runpaths(), 3, 0, Some(vec![true]), "default", None).unwrap_err();
        assert!(err.to_string().contains("expected ensemble size 3"));
    }

    #[test]
    fn test_zero_active_is_hard_stop() {
        let mut ctx = RunContext::build(&runpaths(), 2, 0, None, "default", None).unwrap();
        ctx.deactivate(0).unwrap();
        ctx.deactivate(1).unwrap();
        assert!(matches!(
            ctx.ensure_active(),
            Err(ExecutionError::NoActiveRealizations { iteration: 0 })
        ));
    }

    #[test]
    fn test_deactivate_failed_jobs() {
        let mut ctx = RunContext::build(&runpaths(), 4, 0, Some(vec![true, true, false, true]), "default", None)
            .unwrap();
        ctx.set_run_status(0, RunStatus::LoadSuccess).unwrap();
        ctx.set_run_status(1, RunStatus::LoadFailure).unwrap();
        ctx.set_run_status(3, RunStatus::RunFailure).unwrap();

        assert_eq!(ctx.deactivate_failed_jobs(), vec![1, 3]);
        assert_eq!(ctx.mask(), &[true, false, false, false]);
        assert_eq!(ctx.failed_mask(), vec![false, true, false, true]);
        assert!(ctx.has_failed_realizations());
        assert_eq!(ctx.completed_count(), 1);
    }

    proptest! {
        #[test]
        fn prop_active_count_matches_mask(mask in proptest::collection::vec(any::<bool>(), 1..64)) {
            let n = mask.len();
            let expected = mask.iter().filter(|&&b| b).count();
            let ctx = RunContext::build(&runpaths(), n, 0, Some(mask), "default", None).unwrap();
            prop_assert_eq!(ctx.active_realizations().len(), expected);
            prop_assert_eq!(ctx.count_active(), expected);
            prop_assert_eq!(ctx.run_args().len(), n);
            for i in 0..n {
                prop_assert_eq!(ctx.is_active(i), ctx.run_arg(i).unwrap().is_active());
            }
        }
    }
}
