//! Update orchestration: observations, update steps, screening, the
//! analysis module surface and snapshots.

mod linalg;
mod module;
mod observation;
mod orchestrator;
mod screening;
mod snapshot;
mod update_step;

pub use module::{AnalysisInput, AnalysisModule, EnsembleSmoother, IterativeEnsembleSmoother};
pub use observation::{Observation, ObservationSet};
pub use orchestrator::SmootherUpdate;
pub use screening::{ensemble_moments, ObservationStatus, Screening};
pub use snapshot::{
    render_update_report, write_update_report, ObservationRecord, SnapshotLog, StepSnapshot, UpdateSnapshot,
};
pub use update_step::{ParameterSelection, UpdateConfiguration, UpdateStep, ALL_ACTIVE_STEP};
