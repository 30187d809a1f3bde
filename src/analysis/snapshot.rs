//! Update snapshots and the text update report.
//!
//! A snapshot is written once per smoother update and then only read:
//! the [`SnapshotLog`] hands out shared immutable handles and only ever
//! appends.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::screening::ObservationStatus;
use crate::error::{EnsembleResult, FileSystemError};
use crate::run::RunId;
use crate::storage::write_bytes;

const RULE_WIDTH: usize = 127;

/// Screening outcome of one observed data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    /// Data point name (`key` or `key[pos]`).
    pub name: String,
    /// Observation key the point belongs to.
    pub key: String,
    /// Observed value.
    pub value: f64,
    /// Scaled observation error.
    pub error: f64,
    /// Screening result.
    pub status: ObservationStatus,
    /// Simulated ensemble mean.
    pub response_mean: f64,
    /// Simulated ensemble standard deviation.
    pub response_std: f64,
}

/// What happened in one update step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    /// Step name.
    pub name: String,
    /// Every observed data point of the step, in declaration order.
    pub observations: Vec<ObservationRecord>,
    /// Parameters whose rows were replaced by the analysis.
    pub updated_parameters: Vec<String>,
    /// Error that failed this step, if any.
    pub error: Option<String>,
    /// Free-form diagnostics.
    pub diagnostics: BTreeMap<String, Value>,
}

impl StepSnapshot {
    /// Aggregate status of observation `key`: active if any of its points is.
    #[must_use]
    pub fn status(&self, key: &str) -> Option<ObservationStatus> {
        let mut points = self.observations.iter().filter(|r| r.key == key).peekable();
        points.peek()?;
        if points.any(|r| r.status.is_active()) {
            Some(ObservationStatus::Active)
        } else {
            Some(ObservationStatus::Deactivated)
        }
    }

    /// Number of active data points.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.observations.iter().filter(|r| r.status.is_active()).count()
    }

    /// Returns true if the step failed.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Auditable record of one smoother update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSnapshot {
    /// Run id of the context the update belonged to.
    pub run_id: RunId,
    /// Case the prior was read from.
    pub source_case: String,
    /// Case the posterior was written to.
    pub target_case: String,
    /// Analysis module name.
    pub analysis_module: String,
    /// Analysis module settings.
    pub analysis_configuration: BTreeMap<String, Value>,
    /// Screening factor.
    pub alpha: f64,
    /// Spread cutoff.
    pub std_cutoff: f64,
    /// Observation error multiplier.
    pub global_std_scaling: f64,
    /// Realizations that took part.
    pub realizations: Vec<usize>,
    /// When the update finished.
    pub created_at: DateTime<Utc>,
    /// Per-step records, in declaration order.
    pub steps: Vec<StepSnapshot>,
}

impl UpdateSnapshot {
    /// Record of step `name`.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepSnapshot> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Append-only collection of snapshots for the session lifetime.
#[derive(Debug, Default)]
pub struct SnapshotLog {
    entries: Vec<Arc<UpdateSnapshot>>,
}

impl SnapshotLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a snapshot and return a shared handle to it.
    pub fn record(&mut self, snapshot: UpdateSnapshot) -> Arc<UpdateSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.entries.push(Arc::clone(&snapshot));
        snapshot
    }

    /// Most recent snapshot recorded under `run_id`.
    #[must_use]
    pub fn get(&self, run_id: RunId) -> Option<Arc<UpdateSnapshot>> {
        self.entries.iter().rev().find(|s| s.run_id == run_id).cloned()
    }

    /// Every snapshot recorded under `run_id`, oldest first.
    #[must_use]
    pub fn history(&self, run_id: RunId) -> Vec<Arc<UpdateSnapshot>> {
        self.entries.iter().filter(|s| s.run_id == run_id).cloned().collect()
    }

    /// Most recent snapshot.
    #[must_use]
    pub fn latest(&self) -> Option<Arc<UpdateSnapshot>> {
        self.entries.last().cloned()
    }

    /// Number of snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate snapshots oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<UpdateSnapshot>> {
        self.entries.iter()
    }
}

fn capitalize(status: ObservationStatus) -> &'static str {
    match status {
        ObservationStatus::Active => "Active",
        ObservationStatus::Deactivated => "Inactive",
    }
}

/// Render the observed-versus-simulated table of every step.
#[must_use]
pub fn render_update_report(snapshot: &UpdateSnapshot) -> String {
    let heavy = "=".repeat(RULE_WIDTH);
    let light = "-".repeat(RULE_WIDTH);
    let mut out = String::new();
    for step in &snapshot.steps {
        let _ = writeln!(out, "{heavy}");
        let _ = writeln!(out, "Update step......: {:<10}", step.name);
        if let Some(error) = &step.error {
            let _ = writeln!(out, "Failed...........: {error}");
        }
        let _ = writeln!(out, "{light}");
        let _ = writeln!(out, "{:>73}{:>16}{:>27}", "Observed history", "|", "Simulated data");
        let _ = writeln!(out, "{light}");
        for (nr, rec) in step.observations.iter().enumerate() {
            let _ = writeln!(
                out,
                "{:^6}: {:30} {:>16.3} +/- {:>17.3} {:9} | {:>17.3} +/- {:>15.3}",
                nr + 1,
                rec.name,
                rec.value,
                rec.error,
                capitalize(rec.status),
                rec.response_mean,
                rec.response_std,
            );
        }
        let _ = writeln!(out, "{heavy}");
    }
    out
}

/// Write the update report into `dir` as `update_<run id>.txt`.
pub fn write_update_report(dir: &Path, snapshot: &UpdateSnapshot) -> EnsembleResult<()> {
    fs::create_dir_all(dir).map_err(|e| FileSystemError::io(dir, e))?;
    let path = dir.join(format!("update_{}.txt", snapshot.run_id));
    write_bytes(&path, render_update_report(snapshot).as_bytes(), false).map_err(|e| FileSystemError::io(&path, e))?;
    Ok(())
}
