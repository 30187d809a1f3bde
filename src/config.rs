//! Session configuration.
//!
//! The declarative configuration language that normally produces these
//! values lives outside this crate; here they are plain serde structs with
//! defaults and a `validate` step, loadable from a JSON file.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, EnsembleError, ValidationError};

/// Default number of simultaneously mounted cases.
pub const DEFAULT_MAX_RESIDENT_CASES: usize = 5;

/// Name of the case selected when a storage root has no marker yet.
pub const DEFAULT_CASE_NAME: &str = "default";

fn invalid(field: &str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidConfig {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Storage root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one subdirectory per case.
    pub root: PathBuf,
    /// Number of realizations; fixes the state map length of every case.
    pub ensemble_size: usize,
    /// Maximum number of mounted case handles (the active case included).
    pub max_resident_cases: usize,
    /// How long to wait for the storage-root lock.
    pub lock_timeout_ms: u64,
    /// Whether to fsync every cell write (slower but safer).
    pub sync_on_write: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("storage"),
            ensemble_size: 1,
            max_resident_cases: DEFAULT_MAX_RESIDENT_CASES,
            lock_timeout_ms: 5_000,
            sync_on_write: false,
        }
    }
}

impl StorageConfig {
    /// Configuration for `root` with `ensemble_size` realizations.
    pub fn new(root: impl Into<PathBuf>, ensemble_size: usize) -> Self {
        Self {
            root: root.into(),
            ensemble_size,
            ..Self::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.ensemble_size == 0 {
            return Err(invalid("ensemble_size", "must be at least 1"));
        }
        if self.max_resident_cases == 0 {
            return Err(invalid("max_resident_cases", "must be at least 1"));
        }
        if self.root.as_os_str().is_empty() {
            return Err(invalid("root", "must not be empty"));
        }
        Ok(self)
    }
}

/// Run path and job name formatting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunpathConfig {
    /// Run path template; `<IENS>`/`<ITER>` or positional `%d`.
    pub runpath_template: String,
    /// Job name template; same placeholders as the run path.
    pub jobname_template: String,
    /// Directory that relative run paths are resolved against.
    ///
    /// `None` means the process working directory at session start.
    pub base_dir: Option<PathBuf>,
    /// Run-path manifest location; `None` puts it in the storage root.
    pub manifest_path: Option<PathBuf>,
    /// Base name of the exported `*.txt` / `*.json` parameter files.
    pub parameter_export_name: String,
}

impl Default for RunpathConfig {
    fn default() -> Self {
        Self {
            runpath_template: "simulations/realization-<IENS>/iter-<ITER>".to_string(),
            jobname_template: "JOB-<IENS>".to_string(),
            base_dir: None,
            manifest_path: None,
            parameter_export_name: "parameters".to_string(),
        }
    }
}

impl RunpathConfig {
    /// Validate the configuration.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.runpath_template.trim().is_empty() {
            return Err(invalid("runpath_template", "must not be empty"));
        }
        if self.jobname_template.trim().is_empty() {
            return Err(invalid("jobname_template", "must not be empty"));
        }
        if !self.runpath_template.contains("<IENS>") && !self.runpath_template.contains("%d") {
            return Err(invalid(
                "runpath_template",
                "must contain <IENS> or %d so realizations get distinct run paths",
            ));
        }
        if self.parameter_export_name.trim().is_empty() {
            return Err(invalid("parameter_export_name", "must not be empty"));
        }
        Ok(self)
    }
}

/// Update (analysis) settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Outlier screening factor.
    pub alpha: f64,
    /// Observations whose ensemble spread is at or below this are deactivated.
    pub std_cutoff: f64,
    /// Multiplier applied to every observation error.
    pub global_std_scaling: f64,
    /// Minimum number of realizations with data required to update.
    pub min_realizations: usize,
    /// Where the text update report goes; `None` disables it.
    pub update_log_path: Option<PathBuf>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            alpha: 3.0,
            std_cutoff: 1e-6,
            global_std_scaling: 1.0,
            min_realizations: 1,
            update_log_path: None,
        }
    }
}

impl AnalysisConfig {
    /// Validate the configuration.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if !self.alpha.is_finite() || self.alpha <= 0.0 {
            return Err(invalid("alpha", format!("must be positive and finite (got {})", self.alpha)));
        }
        if !self.std_cutoff.is_finite() || self.std_cutoff < 0.0 {
            return Err(invalid(
                "std_cutoff",
                format!("must be non-negative and finite (got {})", self.std_cutoff),
            ));
        }
        if !self.global_std_scaling.is_finite() || self.global_std_scaling <= 0.0 {
            return Err(invalid(
                "global_std_scaling",
                format!("must be positive and finite (got {})", self.global_std_scaling),
            ));
        }
        if self.min_realizations == 0 {
            return Err(invalid("min_realizations", "must be at least 1"));
        }
        Ok(self)
    }
}

/// Everything a [`crate::Session`] needs besides the ensemble definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Storage root settings.
    pub storage: StorageConfig,
    /// Run path settings.
    pub runpaths: RunpathConfig,
    /// Update settings.
    pub analysis: AnalysisConfig,
    /// Process-wide seed; `None` draws one and logs it.
    pub random_seed: Option<u64>,
    /// Upper bound on waiting for job-queue reports in one round.
    pub round_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            runpaths: RunpathConfig::default(),
            analysis: AnalysisConfig::default(),
            random_seed: None,
            round_timeout_ms: 60 * 60 * 1000,
        }
    }
}

impl SessionConfig {
    /// Validate all sections.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.round_timeout_ms == 0 {
            return Err(invalid("round_timeout_ms", "must be > 0"));
        }
        Ok(Self {
            storage: self.storage.validate()?,
            runpaths: self.runpaths.validate()?,
            analysis: self.analysis.validate()?,
            ..self
        })
    }

    /// Read and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EnsembleError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigurationError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| ConfigurationError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(config.validate()?)
    }
}
