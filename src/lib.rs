//! # ensemble-store - Ensemble Case Storage and Smoother Updates
//!
//! Coordinates ensemble-based history matching: many realizations of a
//! model are run, their outputs are loaded into a versioned case store, and
//! smoother updates turn a prior ensemble into a posterior one.
//!
//! ## Core Concepts
//!
//! - **Case**: a durable, versioned dataset of parameters, responses, a time map and a state map
//! - **StorageManager**: the bounded set of mounted cases and the active-case pointer
//! - **RunContext**: per-realization run descriptors and the activation mask of one round
//! - **PriorSampler**: seeds a case with initial parameter values
//! - **SmootherUpdate**: screens observations, runs the analysis module and writes the posterior
//! - **Session**: ties the above together for one experiment
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ensemble_store::{EnsembleConfig, ObservationSet, Session, SessionConfig};
//!
//! let mut session = Session::open(SessionConfig::from_json_file("session.json")?, ensemble, observations)?;
//! session.sample_prior("prior", &[true; 25], None)?;
//!
//! let mut ctx = session.create_ensemble_smoother_run_context(None, 0, "prior", "posterior")?;
//! session.create_run_paths(&ctx)?;
//! session.run_forward_model(&queue, &mut ctx)?;
//! let snapshot = session.smoother_update(&ctx)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod analysis;
pub mod config;
pub mod error;
pub mod export;
pub mod parameter;
pub mod realization;
pub mod run;
pub mod sampling;
pub mod session;
pub mod storage;
pub mod time_map;

pub use analysis::{
    AnalysisInput, AnalysisModule, EnsembleSmoother, IterativeEnsembleSmoother, Observation, ObservationSet,
    ObservationStatus, ParameterSelection, SmootherUpdate, SnapshotLog, StepSnapshot, UpdateConfiguration, UpdateSnapshot, UpdateStep,
};
pub use config::{AnalysisConfig, RunpathConfig, SessionConfig, StorageConfig};
pub use error::{
    AnalysisError, ConfigurationError, EnsembleError, EnsembleResult, ExecutionError, FileSystemError,
    RealizationFailure, StorageError, ValidationError,
};
pub use parameter::{Distribution, EnsembleConfig, ExtKey, GenKwKey, ParameterConfig, ParameterKind};
pub use realization::{RealizationState, StateMap};
pub use run::{Job, JobQueue, JobReport, JobStatus, Reporter, RunArg, RunContext, RunId, RunStatus, Runpaths};
pub use sampling::{PriorSampler, SampleReport};
pub use session::{ForwardModelReport, Session};
pub use storage::{CaseStore, StorageManager};
pub use time_map::TimeMap;
