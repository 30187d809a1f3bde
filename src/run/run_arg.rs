//! Per-realization run descriptors.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic run ids.
const RUN_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6e8b_4f0c_2a71_4d5e_9c3b_7f1a_52d0_e4b9);

/// Deterministic identifier of one run.
///
/// The same (case, iteration, realization) always yields the same id, so
/// rebuilding a context reproduces its job identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Id of one realization's run.
    #[must_use]
    pub fn for_realization(case: &str, iteration: usize, realization: usize) -> Self {
        Self(Uuid::new_v5(
            &RUN_ID_NAMESPACE,
            format!("{case}/{iteration}/{realization}").as_bytes(),
        ))
    }

    /// Id of a whole round (source to optional target at an iteration).
    #[must_use]
    pub fn for_round(source: &str, target: Option<&str>, iteration: usize) -> Self {
        let target = target.unwrap_or("");
        Self(Uuid::new_v5(
            &RUN_ID_NAMESPACE,
            format!("{source}->{target}@{iteration}").as_bytes(),
        ))
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of one realization's run, set after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Not submitted or not reported yet.
    Pending,
    /// The job queue reported a failure, or never reported.
    RunFailure,
    /// Results were loaded.
    LoadSuccess,
    /// The job finished but its results could not be loaded.
    LoadFailure,
}

impl RunStatus {
    /// Returns true for either failure.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::RunFailure | Self::LoadFailure)
    }
}

/// Everything the job queue needs to run one realization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArg {
    realization: usize,
    iteration: usize,
    run_id: RunId,
    runpath: PathBuf,
    job_name: String,
    source_case: String,
    active: bool,
    run_status: RunStatus,
}

impl RunArg {
    /// Create a pending run descriptor.
    #[must_use]
    pub fn new(
        realization: usize,
        iteration: usize,
        runpath: PathBuf,
        job_name: String,
        source_case: &str,
        active: bool,
    ) -> Self {
        Self {
            realization,
            iteration,
            run_id: RunId::for_realization(source_case, iteration, realization),
            runpath,
            job_name,
            source_case: source_case.to_string(),
            active,
            run_status: RunStatus::Pending,
        }
    }

    /// Realization index.
    #[must_use]
    pub const fn realization(&self) -> usize {
        self.realization
    }

    /// Iteration number.
    #[must_use]
    pub const fn iteration(&self) -> usize {
        self.iteration
    }

    /// Deterministic run id.
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Absolute run path.
    #[must_use]
    pub fn runpath(&self) -> &Path {
        &self.runpath
    }

    /// Job name.
    #[must_use]
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Case the run reads parameters from and loads results into.
    #[must_use]
    pub fn source_case(&self) -> &str {
        &self.source_case
    }

    /// Whether the realization takes part in the run.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Current run status.
    #[must_use]
    pub const fn run_status(&self) -> RunStatus {
        self.run_status
    }

    pub(crate) fn deactivate(&mut self) {
        self.active = false;
    }

    pub(crate) fn set_run_status(&mut self, status: RunStatus) {
        self.run_status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_is_deterministic() {
        assert_eq!(
            RunId::for_realization("default", 0, 3),
            RunId::for_realization("default", 0, 3)
        );
        assert_ne!(
            RunId::for_realization("default", 0, 3),
            RunId::for_realization("default", 1, 3)
        );
        assert_ne!(
            RunId::for_round("prior", Some("posterior"), 0),
            RunId::for_round("prior", None, 0)
        );
    }

    #[test]
    fn test_new_run_arg_is_pending() {
        let arg = RunArg::new(2, 1, PathBuf::from("/tmp/r2"), "JOB-2".to_string(), "default", true);
        assert_eq!(arg.run_status(), RunStatus::Pending);
        assert_eq!(arg.run_id(), RunId::for_realization("default", 1, 2));
        assert!(arg.is_active());
    }
}
