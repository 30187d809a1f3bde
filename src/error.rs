//! Error types for ensemble storage and update orchestration.
//!
//! Hard failures are strongly typed using thiserror and abort the
//! operation that raised them. Soft, per-realization failures are not
//! errors at all: they are carried as [`RealizationFailure`] records inside
//! the reports returned by sampling, loading and round collection, and the
//! surrounding operation continues with the reduced active set.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::realization::RealizationState;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid case name '{name}': {reason}")]
    InvalidCaseName {
        name: String,
        reason: String,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Mask has {actual} entries, expected ensemble size {expected}")]
    MaskLength {
        actual: usize,
        expected: usize,
    },

    #[error("Realization {realization} is outside ensemble of size {ensemble_size}")]
    RealizationOutOfRange {
        realization: usize,
        ensemble_size: usize,
    },

    #[error("Illegal state transition for realization {realization}: {from} -> {to}")]
    IllegalStateTransition {
        realization: usize,
        from: RealizationState,
        to: RealizationState,
    },

    #[error("Invalid template '{template}': {reason}")]
    InvalidTemplate {
        template: String,
        reason: String,
    },

    #[error("Parameter '{key}' expects {expected} values, got {actual}")]
    ValueCountMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },

    #[error("Localization index {index} is outside parameter '{key}' of size {size}")]
    LocalizationOutOfRange {
        key: String,
        index: usize,
        size: usize,
    },

    #[error("Time map conflict at report step {step}: stored {stored}, got {got}")]
    TimeMapConflict {
        step: usize,
        stored: String,
        got: String,
    },
}

/// Which side of a format-version mismatch is behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSkew {
    /// The case was written by a later format than this engine reads.
    EngineOlder,
    /// The case was written by an earlier format than this engine reads.
    EngineNewer,
}

impl VersionSkew {
    /// Classify a stored version against the version this engine expects.
    #[must_use]
    pub const fn classify(found: u32, expected: u32) -> Option<Self> {
        if found > expected {
            Some(Self::EngineOlder)
        } else if found < expected {
            Some(Self::EngineNewer)
        } else {
            None
        }
    }
}

impl fmt::Display for VersionSkew {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EngineOlder => f.write_str("older"),
            Self::EngineNewer => f.write_str("newer"),
        }
    }
}

/// Errors raised while reading or writing case directories.
#[derive(Debug, Error)]
pub enum FileSystemError {
    #[error(
        "Case '{case}' was written with storage format version {found}, \
         but this engine is {skew} and only reads version {expected}"
    )]
    VersionMismatch {
        case: String,
        found: u32,
        expected: u32,
        skew: VersionSkew,
    },

    #[error("Corrupt case data at {}: {reason}", .path.display())]
    Corrupt {
        path: PathBuf,
        reason: String,
    },

    #[error("Case '{case}' has ensemble size {found}, expected {expected}")]
    EnsembleSizeMismatch {
        case: String,
        found: usize,
        expected: usize,
    },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FileSystemError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from the storage root: locking and handle management.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(
        "Timed out after {waited_ms}ms waiting for storage lock {}: another process holds the lock",
        .path.display()
    )]
    LockTimeout {
        path: PathBuf,
        waited_ms: u64,
    },

    #[error("Failed to lock storage root {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Lookups against configuration that failed (the KeyError class).
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Unknown case: {name}, valid: {known:?}")]
    UnknownCase {
        name: String,
        known: Vec<String>,
    },

    #[error("Unknown parameter key: {key}")]
    UnknownParameter {
        key: String,
    },

    #[error("Unknown observation key: {key}")]
    UnknownObservation {
        key: String,
    },

    #[error("Unknown response key: {key}")]
    UnknownResponse {
        key: String,
    },

    #[error("Shared init file {} for parameter '{key}' could not be used: {reason}", .path.display())]
    SharedInitFile {
        key: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Failed to read configuration {}: {reason}", .path.display())]
    Unreadable {
        path: PathBuf,
        reason: String,
    },
}

/// Errors raised by the update orchestrator.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("No active observations for update step: {step}.")]
    NoActiveObservations {
        step: String,
    },

    #[error(
        "There are {active} active realisations left, which is less than the minimum \
         specified ({required}) - stopping assimilation."
    )]
    NotEnoughRealizations {
        active: usize,
        required: usize,
    },

    #[error("Analysis module failed in update step '{step}': {reason}")]
    ModuleFailed {
        step: String,
        reason: String,
    },

    #[error(
        "Analysis module returned a {actual_rows}x{actual_cols} matrix in update step '{step}', \
         expected {expected_rows}x{expected_cols}"
    )]
    ShapeMismatch {
        step: String,
        expected_rows: usize,
        expected_cols: usize,
        actual_rows: usize,
        actual_cols: usize,
    },

    #[error("Can not combine {module} with multi step updates ({steps} steps configured)")]
    IterativeMultiStep {
        module: String,
        steps: usize,
    },

    #[error("Stored parameter '{key}' has {actual} values per realization, configuration declares {expected}")]
    ParameterSizeMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },

    #[error("Missing parameter '{key}' for realization {realization}")]
    MissingParameter {
        key: String,
        realization: usize,
    },

    #[error("Missing response '{key}' at report step {step} for realization {realization}")]
    MissingResponse {
        key: String,
        step: usize,
        realization: usize,
    },
}

/// Errors raised while executing a simulation round.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("No active realizations in iteration {iteration}")]
    NoActiveRealizations {
        iteration: usize,
    },

    #[error("Job queue error: {message}")]
    JobQueue {
        message: String,
    },

    #[error("Refusing to export NaN for {key} in realization {realization}")]
    NanInExport {
        key: String,
        realization: usize,
    },
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum EnsembleError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("File system error: {0}")]
    FileSystem(#[from] FileSystemError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl EnsembleError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a KeyError-class lookup failure.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is a file system error.
    #[must_use]
    pub const fn is_file_system(&self) -> bool {
        matches!(self, Self::FileSystem(_))
    }

    /// Returns true if this is an analysis error.
    #[must_use]
    pub const fn is_analysis(&self) -> bool {
        matches!(self, Self::Analysis(_))
    }

    /// Returns true if the storage lock could not be obtained.
    #[must_use]
    pub const fn is_resource(&self) -> bool {
        matches!(self, Self::Storage(StorageError::LockTimeout { .. }))
    }

    /// Returns true if the error stops the experiment, not just one
    /// update step or one round.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.is_analysis() && !self.is_resource()
    }

    /// Returns true if this error is retryable.
    ///
    /// Only lock contention may clear up on its own; everything else is
    /// deterministic given the same inputs.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.is_resource()
    }
}

impl From<serde_json::Error> for EnsembleError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("JSON error: {err}"))
    }
}

/// Result type alias for ensemble operations.
pub type EnsembleResult<T> = Result<T, EnsembleError>;

/// A soft failure confined to one realization.
///
/// These are recorded in the state map or activation mask and reported
/// to the caller through counts; they never abort the surrounding call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealizationFailure {
    /// Realization index.
    pub realization: usize,
    /// Human-readable reason.
    pub reason: String,
}

impl RealizationFailure {
    /// Create a failure record.
    pub fn new(realization: usize, reason: impl Into<String>) -> Self {
        Self {
            realization,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for RealizationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:03}] {}", self.realization, self.reason)
    }
}
