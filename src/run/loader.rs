//! Loading forward-model results back into a case.
//!
//! A finished run path holds:
//! - one file per forward-init parameter, at the parameter's init-file
//!   template resolved inside the run path;
//! - `responses.json` with simulated dates and response vectors:
//!
//! ```json
//! { "dates": ["2015-06-01T00:00:00Z"], "responses": { "FOPR": { "0": [0.1, 0.2] } } }
//! ```

use std::collections::BTreeMap;
use std::fs;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::context::RunContext;
use super::run_arg::{RunArg, RunStatus};
use super::runpaths::format_template;
use crate::error::{EnsembleResult, RealizationFailure, ValidationError};
use crate::parameter::EnsembleConfig;
use crate::realization::RealizationState;
use crate::storage::CaseStore;

/// Response file written by the forward model into each run path.
pub const RESPONSES_FILE: &str = "responses.json";

#[derive(Debug, Deserialize)]
struct ResponseFile {
    #[serde(default)]
    dates: Vec<DateTime<Utc>>,
    #[serde(default)]
    responses: BTreeMap<String, BTreeMap<usize, Vec<f64>>>,
}

/// Reads one realization's results from wherever the forward model left them.
pub trait ResultLoader {
    /// Load results for `run_arg` into `case`.
    ///
    /// An `Err` fails this realization only.
    fn load(&self, case: &CaseStore, ensemble: &EnsembleConfig, run_arg: &RunArg) -> Result<(), String>;
}

/// Default loader reading files from the run path.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunPathLoader;

impl RunPathLoader {
    fn load_forward_init(case: &CaseStore, ensemble: &EnsembleConfig, run_arg: &RunArg) -> Result<(), String> {
        let iens = run_arg.realization();
        for param in ensemble.parameters().iter().filter(|p| p.forward_init) {
            let Some(template) = &param.init_files else {
                continue;
            };
            let name = format_template(template, iens, run_arg.iteration()).map_err(|e| e.to_string())?;
            let path = run_arg.runpath().join(name);
            let text = fs::read_to_string(&path)
                .map_err(|e| format!("{}: failed to read {}: {e}", param.key, path.display()))?;
            let values = param
                .kind
                .parse_values(&text)
                .map_err(|e| format!("{}: {}: {e}", param.key, path.display()))?;
            case.save_parameter(&param.key, iens, &values).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn load_responses(case: &CaseStore, ensemble: &EnsembleConfig, run_arg: &RunArg) -> Result<(), String> {
        if ensemble.response_keys().is_empty() {
            return Ok(());
        }
        let path = run_arg.runpath().join(RESPONSES_FILE);
        let text = fs::read_to_string(&path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        let file: ResponseFile =
            serde_json::from_str(&text).map_err(|e| format!("malformed {}: {e}", path.display()))?;

        case.update_time_map(&file.dates).map_err(|e| e.to_string())?;

        let iens = run_arg.realization();
        for key in ensemble.response_keys() {
            let steps = file
                .responses
                .get(key)
                .ok_or_else(|| format!("response '{key}' missing from {}", path.display()))?;
            for (&step, values) in steps {
                if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
                    return Err(format!("response '{key}' step {step} value {pos} is not finite"));
                }
                case.save_response(key, iens, step, values).map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }
}

impl ResultLoader for RunPathLoader {
    fn load(&self, case: &CaseStore, ensemble: &EnsembleConfig, run_arg: &RunArg) -> Result<(), String> {
        Self::load_forward_init(case, ensemble, run_arg)?;
        Self::load_responses(case, ensemble, run_arg)
    }
}

/// Outcome of loading one round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Number of realizations now `HasData`.
    pub loaded: usize,
    /// Realizations that failed to load.
    pub failures: Vec<RealizationFailure>,
}

/// Load every active realization of `context` into `case`.
///
/// Success moves the realization to `HasData`; failure to `LoadFailure`
/// and the run status records which. Failures never abort the call.
pub fn load_from_run_path(
    loader: &dyn ResultLoader,
    case: &CaseStore,
    ensemble: &EnsembleConfig,
    context: &mut RunContext,
) -> EnsembleResult<LoadReport> {
    let mut report = LoadReport::default();

    for iens in context.active_realizations() {
        if case.state(iens)? == RealizationState::ParentFailure {
            context.set_run_status(iens, RunStatus::LoadFailure)?;
            report
                .failures
                .push(RealizationFailure::new(iens, "parent realization failed"));
            continue;
        }
        let Some(run_arg) = context.run_arg(iens) else {
            continue;
        };

        match loader.load(case, ensemble, run_arg) {
            Ok(()) => {
                case.modify_state_map(|map| {
                    map.advance_to_initialized(iens)?;
                    map.set(iens, RealizationState::HasData)
                })?;
                context.set_run_status(iens, RunStatus::LoadSuccess)?;
                report.loaded += 1;
                debug!(case = %case.name(), realization = iens, "loaded results");
            }
            Err(reason) => {
                warn!(case = %case.name(), realization = iens, %reason, "failed to load results");
                case.set_state(iens, RealizationState::LoadFailure)?;
                context.set_run_status(iens, RunStatus::LoadFailure)?;
                report.failures.push(RealizationFailure::new(iens, reason));
            }
        }
    }

    info!(
        case = %case.name(),
        loaded = report.loaded,
        failed = report.failures.len(),
        "loaded realizations"
    );
    Ok(report)
}

/// Mark realizations as `LoadFailure` in `case`.
pub fn mark_load_failures(case: &CaseStore, failures: &[RealizationFailure]) -> EnsembleResult<()> {
    case.modify_state_map(|map| {
        for failure in failures {
            map.set(failure.realization, RealizationState::LoadFailure)?;
        }
        Ok::<(), ValidationError>(())
    })
}
