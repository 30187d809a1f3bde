//! Run contexts, run paths, job-queue rounds and result loading.

mod context;
mod loader;
mod queue;
mod run_arg;
mod runpaths;

pub use context::RunContext;
pub use loader::{load_from_run_path, mark_load_failures, LoadReport, ResultLoader, RunPathLoader, RESPONSES_FILE};
pub use queue::{run_round, Job, JobQueue, JobReport, JobStatus, Reporter, RoundOutcome};
pub use run_arg::{RunArg, RunId, RunStatus};
pub use runpaths::{
    format_template, has_realization_placeholder, read_manifest, ManifestEntry, Runpaths, MANIFEST_FILE,
};
