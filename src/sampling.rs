//! Prior sampling: getting the initial parameters into a case.
//!
//! For each requested parameter:
//! - forward-init parameters are skipped (the forward model writes them);
//! - parameters with an init-file template are read per realization;
//! - everything else that can be sampled is drawn from a stream seeded
//!   by the session seed and the parameter key.
//!
//! Draws always cover the whole ensemble in realization order and the
//! active subset is picked afterwards, so a realization's values never
//! depend on which other realizations were active.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::StandardNormal;
use tracing::{debug, info, warn};

use crate::error::{ConfigurationError, EnsembleResult, RealizationFailure, ValidationError};
use crate::parameter::{EnsembleConfig, ParameterConfig};
use crate::realization::RealizationState;
use crate::run::{format_template, has_realization_placeholder};
use crate::storage::CaseStore;

/// Derive an independent stream for one named consumer of a seed.
#[must_use]
pub fn derive_rng(seed: u64, name: &str) -> ChaCha20Rng {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    hasher.update(name.as_bytes());
    ChaCha20Rng::from_seed(*hasher.finalize().as_bytes())
}

/// Outcome of one sampling call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleReport {
    /// Keys whose values were written (sampled or loaded).
    pub written: Vec<String>,
    /// Keys skipped because they are forward-init or externally populated.
    pub skipped: Vec<String>,
    /// Realizations advanced to `Initialized` by this call.
    pub initialized: usize,
    /// Realizations whose init files could not be used.
    pub failures: Vec<RealizationFailure>,
}

/// Seeds cases with prior parameter values.
#[derive(Debug, Clone)]
pub struct PriorSampler {
    seed: u64,
    init_base: PathBuf,
}

impl PriorSampler {
    /// Sampler drawing from `seed`; relative init-file paths resolve
    /// against `init_base`.
    pub fn new(seed: u64, init_base: impl Into<PathBuf>) -> Self {
        Self {
            seed,
            init_base: init_base.into(),
        }
    }

    /// Seed this sampler draws from.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Draw standard-normal values for every realization of the ensemble.
    ///
    /// Row `i` belongs to realization `i`.
    #[must_use]
    pub fn draw(&self, key: &str, size: usize, ensemble_size: usize) -> Vec<Vec<f64>> {
        let mut rng = derive_rng(self.seed, key);
        (0..ensemble_size)
            .map(|_| (&mut rng).sample_iter(StandardNormal).take(size).collect())
            .collect()
    }

    fn init_path(&self, template: &str, realization: usize) -> EnsembleResult<PathBuf> {
        let name = format_template(template, realization, 0)?;
        Ok(self.init_base.join(name))
    }

    fn read_init_file(param: &ParameterConfig, path: &Path) -> Result<Vec<f64>, String> {
        let text = fs::read_to_string(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        param
            .kind
            .parse_values(&text)
            .map_err(|e| format!("{}: {e}", path.display()))
    }

    /// Write prior values for `keys` into `case` for the active realizations.
    ///
    /// Unknown keys fail before anything is written. A bad per-realization
    /// init file fails that realization only; a bad shared init file fails
    /// the call. Afterwards `Undefined`/`LoadFailure` entries of the
    /// processed realizations become `Initialized`.
    pub fn sample(
        &self,
        case: &CaseStore,
        ensemble: &EnsembleConfig,
        active: &[bool],
        keys: &[String],
    ) -> EnsembleResult<SampleReport> {
        let ensemble_size = case.ensemble_size();
        if active.len() != ensemble_size {
            return Err(ValidationError::MaskLength {
                actual: active.len(),
                expected: ensemble_size,
            }
            .into());
        }
        let params = keys
            .iter()
            .map(|key| ensemble.parameter(key))
            .collect::<Result<Vec<_>, _>>()?;
        let realizations: Vec<usize> = (0..ensemble_size).filter(|&i| active[i]).collect();

        let mut report = SampleReport::default();
        let mut failed = BTreeSet::new();

        for param in params {
            if param.forward_init {
                debug!(key = %param.key, "skipping forward-init parameter");
                report.skipped.push(param.key.clone());
                continue;
            }

            match &param.init_files {
                Some(template) if has_realization_placeholder(template) => {
                    for &iens in &realizations {
                        let path = self.init_path(template, iens)?;
                        match Self::read_init_file(param, &path) {
                            Ok(values) => case.save_parameter(&param.key, iens, &values)?,
                            Err(reason) => {
                                warn!(key = %param.key, realization = iens, %reason, "init file rejected");
                                failed.insert(iens);
                                report
                                    .failures
                                    .push(RealizationFailure::new(iens, format!("{}: {reason}", param.key)));
                            }
                        }
                    }
                }
                Some(template) => {
                    let path = self.init_path(template, 0)?;
                    let values =
                        Self::read_init_file(param, &path).map_err(|reason| ConfigurationError::SharedInitFile {
                            key: param.key.clone(),
                            path: path.clone(),
                            reason,
                        })?;
                    for &iens in &realizations {
                        case.save_parameter(&param.key, iens, &values)?;
                    }
                }
                None if param.kind.is_sampled() => {
                    let draws = self.draw(&param.key, param.size(), ensemble_size);
                    for &iens in &realizations {
                        case.save_parameter(&param.key, iens, &draws[iens])?;
                    }
                }
                None => {
                    debug!(key = %param.key, kind = param.kind.name(), "no init files, not sampled");
                    report.skipped.push(param.key.clone());
                    continue;
                }
            }
            debug!(key = %param.key, kind = param.kind.name(), realizations = realizations.len(), "wrote prior");
            report.written.push(param.key.clone());
        }

        report.initialized = case.modify_state_map(|map| {
            let mut advanced = 0;
            for &iens in &realizations {
                if failed.contains(&iens) {
                    if matches!(
                        map.get(iens),
                        Some(
                            RealizationState::Undefined
                                | RealizationState::Initialized
                                | RealizationState::LoadFailure
                        )
                    ) {
                        map.set(iens, RealizationState::LoadFailure)?;
                    }
                } else if map.advance_to_initialized(iens)? {
                    advanced += 1;
                }
            }
            Ok::<usize, ValidationError>(advanced)
        })?;

        info!(
            case = %case.name(),
            written = report.written.len(),
            initialized = report.initialized,
            failed = report.failures.len(),
            "sampled prior"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::{Distribution, ExtKey, GenKwKey, ParameterKind};
    use crate::storage::CASE_FORMAT_VERSION;
    use tempfile::tempdir;

    fn ensemble() -> EnsembleConfig {
        EnsembleConfig::new()
            .with_parameter(ParameterConfig::new(
                "KW",
                ParameterKind::GenKw {
                    keys: vec![
                        GenKwKey::new("A", Distribution::Normal { mean: 0.0, std: 1.0 }),
                        GenKwKey::new("B", Distribution::Uniform { min: 0.0, max: 1.0 }),
                    ],
                },
            ))
            .unwrap()
            .with_parameter(ParameterConfig::new(
                "EXT",
                ParameterKind::ExtParam {
                    keys: vec![ExtKey { name: "x".to_string(), suffixes: vec![] }],
                },
            ))
            .unwrap()
    }

    fn case(dir: &Path, n: usize) -> CaseStore {
        CaseStore::create(&dir.join("c"), "c", n, CASE_FORMAT_VERSION, false).unwrap()
    }

    #[test]
    fn test_draws_are_deterministic_and_keyed() {
        let sampler = PriorSampler::new(42, ".");
        assert_eq!(sampler.draw("KW", 3, 4), sampler.draw("KW", 3, 4));
        assert_ne!(sampler.draw("KW", 3, 4), sampler.draw("OTHER", 3, 4));
        assert_ne!(sampler.draw("KW", 3, 4), PriorSampler::new(43, ".").draw("KW", 3, 4));
    }

    #[test]
    fn test_values_independent_of_mask() {
        let dir = tempdir().unwrap();
        let full = case(dir.path(), 4);
        let partial = CaseStore::create(&dir.path().join("p"), "p", 4, CASE_FORMAT_VERSION, false).unwrap();
        let sampler = PriorSampler::new(7, dir.path());
        let keys = vec!["KW".to_string()];
        sampler.sample(&full, &ensemble(), &[true; 4], &keys).unwrap();
        sampler
            .sample(&partial, &ensemble(), &[false, false, true, false], &keys)
            .unwrap();
        assert_eq!(full.load_parameter("KW", 2).unwrap(), partial.load_parameter("KW", 2).unwrap());
        assert!(!partial.has_parameter("KW", 0));
    }

    #[test]
    fn test_unknown_key_is_configuration_error() {
        let dir = tempdir().unwrap();
        let case = case(dir.path(), 2);
        let err = PriorSampler::new(1, ".")
            .sample(&case, &ensemble(), &[true, true], &["NOPE".to_string()])
            .unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(case.state(0).unwrap(), RealizationState::Undefined);
    }

    #[test]
    fn test_ext_param_without_files_is_skipped() {
        let dir = tempdir().unwrap();
        let case = case(dir.path(), 2);
        let report = PriorSampler::new(1, ".")
            .sample(&case, &ensemble(), &[true, true], &["EXT".to_string()])
            .unwrap();
        assert_eq!(report.skipped, vec!["EXT".to_string()]);
        assert_eq!(report.initialized, 2);
        assert!(!case.has_parameter("EXT", 0));
    }

    #[test]
    fn test_bad_init_file_fails_realization_only() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("poro_0.txt"), "1 2 3").unwrap();
        fs::write(dir.path().join("poro_1.txt"), "1 2").unwrap();
        let ensemble = EnsembleConfig::new()
            .with_parameter(
                ParameterConfig::new("PORO", ParameterKind::Field { size: 3 }).with_init_files("poro_<IENS>.txt"),
            )
            .unwrap();
        let case = case(dir.path(), 3);
        let report = PriorSampler::new(1, dir.path())
            .sample(&case, &ensemble, &[true, true, true], &["PORO".to_string()])
            .unwrap();

        assert_eq!(report.initialized, 1);
        assert_eq!(report.failures.iter().map(|f| f.realization).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(case.load_parameter("PORO", 0).unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(case.state(1).unwrap(), RealizationState::LoadFailure);
        assert_eq!(case.state(2).unwrap(), RealizationState::LoadFailure);
    }

    #[test]
    fn test_bad_shared_init_file_is_fatal() {
        let dir = tempdir().unwrap();
        let ensemble = EnsembleConfig::new()
            .with_parameter(ParameterConfig::new("S", ParameterKind::Surface { size: 2 }).with_init_files("shared.txt"))
            .unwrap();
        let case = case(dir.path(), 2);
        let err = PriorSampler::new(1, dir.path())
            .sample(&case, &ensemble, &[true, true], &["S".to_string()])
            .unwrap_err();
        assert!(err.is_configuration());

        fs::write(dir.path().join("shared.txt"), "4 5").unwrap();
        PriorSampler::new(1, dir.path())
            .sample(&case, &ensemble, &[true, true], &["S".to_string()])
            .unwrap();
        assert_eq!(case.load_parameter("S", 1).unwrap(), vec![4.0, 5.0]);
    }

    #[test]
    fn test_draw_moments() {
        let n: u32 = 20_000;
        let draws: Vec<f64> = PriorSampler::new(11, ".")
            .draw("moments", 1, n as usize)
            .into_iter()
            .flatten()
            .collect();
        let mean = draws.iter().sum::<f64>() / f64::from(n);
        let var = draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / f64::from(n);
        assert!(mean.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.05);
    }
}
