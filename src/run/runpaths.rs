//! Run path and job name formatting, and the run-path manifest.
//!
//! Templates accept `<IENS>` and `<ITER>` placeholders, and the legacy
//! positional `%d` (first is the realization, second the iteration).
//!
//! The manifest lists every materialized run, one line each:
//!
//! ```text
//! 000  /abs/simulations/realization-0/iter-0  JOB-0  000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::config::RunpathConfig;
use crate::error::{EnsembleError, EnsembleResult, FileSystemError, ValidationError};
use crate::storage::write_bytes;

/// Default manifest file name in the storage root.
pub const MANIFEST_FILE: &str = ".runpath_list";

static PLACEHOLDER_RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn placeholder_re() -> EnsembleResult<&'static Regex> {
    PLACEHOLDER_RE
        .get_or_init(|| Regex::new(r"<IENS>|<ITER>|%d"))
        .as_ref()
        .map_err(|e| EnsembleError::internal(format!("placeholder pattern: {e}")))
}

/// Substitute realization and iteration into a template.
pub fn format_template(template: &str, realization: usize, iteration: usize) -> EnsembleResult<String> {
    let re = placeholder_re()?;
    let positional = template.matches("%d").count();
    if positional > 2 {
        return Err(ValidationError::InvalidTemplate {
            template: template.to_string(),
            reason: format!("{positional} '%d' placeholders, at most 2 allowed"),
        }
        .into());
    }
    let mut seen = 0usize;
    let out = re.replace_all(template, |caps: &Captures<'_>| match &caps[0] {
        "<IENS>" => realization.to_string(),
        "<ITER>" => iteration.to_string(),
        _ => {
            seen += 1;
            if seen == 1 {
                realization.to_string()
            } else {
                iteration.to_string()
            }
        }
    });
    Ok(out.into_owned())
}

/// Returns true if the template varies with the realization.
#[must_use]
pub fn has_realization_placeholder(template: &str) -> bool {
    template.contains("<IENS>") || template.contains("%d")
}

/// One line of the run-path manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Realization index.
    pub realization: usize,
    /// Absolute run path.
    pub runpath: PathBuf,
    /// Job name.
    pub job_name: String,
    /// Iteration number.
    pub iteration: usize,
}

/// Formats run paths and job names and maintains the manifest.
#[derive(Debug, Clone)]
pub struct Runpaths {
    runpath_template: String,
    jobname_template: String,
    base_dir: PathBuf,
    manifest_path: PathBuf,
}

impl Runpaths {
    /// Build from configuration.
    ///
    /// Relative templates resolve against `base_dir` (or the current
    /// directory); the manifest defaults to the storage root.
    pub fn new(config: &RunpathConfig, storage_root: &Path) -> EnsembleResult<Self> {
        let config = config.clone().validate()?;
        let base_dir = match config.base_dir {
            Some(dir) => dir,
            None => std::env::current_dir().map_err(|e| FileSystemError::io(".", e))?,
        };
        let manifest_path = config
            .manifest_path
            .unwrap_or_else(|| storage_root.join(MANIFEST_FILE));
        // Fail early on malformed templates.
        format_template(&config.runpath_template, 0, 0)?;
        format_template(&config.jobname_template, 0, 0)?;
        Ok(Self {
            runpath_template: config.runpath_template,
            jobname_template: config.jobname_template,
            base_dir,
            manifest_path,
        })
    }

    /// Absolute run path of one realization at one iteration.
    pub fn runpath(&self, realization: usize, iteration: usize) -> EnsembleResult<PathBuf> {
        let formatted = format_template(&self.runpath_template, realization, iteration)?;
        Ok(self.base_dir.join(formatted))
    }

    /// Job name of one realization at one iteration.
    pub fn job_name(&self, realization: usize, iteration: usize) -> EnsembleResult<String> {
        format_template(&self.jobname_template, realization, iteration)
    }

    /// Directory relative paths resolve against.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Location of the manifest.
    #[must_use]
    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// Returns true if any run path for these iterations and realizations exists.
    pub fn any_exists(&self, iterations: &[usize], realizations: &[usize]) -> EnsembleResult<bool> {
        for &iter in iterations {
            for &iens in realizations {
                if self.runpath(iens, iter)?.exists() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Write the manifest, ordered by iteration then realization.
    pub fn write_manifest(&self, iterations: &[usize], realizations: &[usize]) -> EnsembleResult<()> {
        let mut iterations = iterations.to_vec();
        iterations.sort_unstable();
        iterations.dedup();
        let mut realizations = realizations.to_vec();
        realizations.sort_unstable();
        realizations.dedup();

        let mut out = String::new();
        for &iter in &iterations {
            for &iens in &realizations {
                let path = self.runpath(iens, iter)?;
                let job = self.job_name(iens, iter)?;
                out.push_str(&format!("{iens:03}  {}  {job}  {iter:03}\n", path.display()));
            }
        }
        write_bytes(&self.manifest_path, out.as_bytes(), false)
            .map_err(|e| FileSystemError::io(&self.manifest_path, e))?;
        Ok(())
    }

    /// Read the manifest back.
    pub fn read_manifest(&self) -> EnsembleResult<Vec<ManifestEntry>> {
        read_manifest(&self.manifest_path)
    }
}

/// Parse a manifest file.
pub fn read_manifest(path: &Path) -> EnsembleResult<Vec<ManifestEntry>> {
    let text = fs::read_to_string(path).map_err(|e| FileSystemError::io(path, e))?;
    let corrupt = |line: usize, reason: &str| FileSystemError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("line {}: {reason}", line + 1),
    };

    let mut entries = Vec::new();
    for (n, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split("  ").map(str::trim).filter(|f| !f.is_empty()).collect();
        let [iens, runpath, job, iter] = fields[..] else {
            return Err(corrupt(n, "expected 4 fields").into());
        };
        entries.push(ManifestEntry {
            realization: iens.parse().map_err(|_| corrupt(n, "bad realization"))?,
            runpath: PathBuf::from(runpath),
            job_name: job.to_string(),
            iteration: iter.parse().map_err(|_| corrupt(n, "bad iteration"))?,
        });
    }
    Ok(entries)
}
