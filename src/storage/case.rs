//! On-disk case store.
//!
//! A case is one directory under the storage root:
//!
//! ```text
//! <root>/<case>/
//!   case.meta                      format version, name, ensemble size
//!   state_map                      one lifecycle state per realization
//!   time_map                       report step -> simulated date
//!   parameters/<key>/<iens>.0      one cell per (parameter, realization)
//!   responses/<key>/<iens>.<step>  one cell per (response, realization, step)
//! ```
//!
//! Every file is codec-framed and replaced atomically. Cells for different
//! realizations are independent files, so writers never contend across
//! realizations. The state map and time map are held in memory behind
//! `RwLock`s and written through on every change.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::codec;
use crate::error::{EnsembleResult, FileSystemError, StorageError, ValidationError, VersionSkew};
use crate::realization::{RealizationState, StateMap};
use crate::time_map::TimeMap;

/// Storage format version written by this engine.
pub const CASE_FORMAT_VERSION: u32 = 1;

const META_FILE: &str = "case.meta";
const STATE_MAP_FILE: &str = "state_map";
const TIME_MAP_FILE: &str = "time_map";
const PARAMETER_DIR: &str = "parameters";
const RESPONSE_DIR: &str = "responses";

/// Parameters live at report step 0.
const PARAMETER_STEP: usize = 0;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

/// Map a codec read failure to the file system taxonomy.
fn read_err(path: &Path, e: io::Error) -> FileSystemError {
    match e.kind() {
        ErrorKind::InvalidData | ErrorKind::UnexpectedEof => FileSystemError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        },
        _ => FileSystemError::io(path, e),
    }
}

/// Turn a variable name into a single safe path component.
///
/// Alphanumerics, `-`, `_` and `.` pass through; everything else becomes
/// `%XX`. A leading `.` is escaped so keys never collide with temp files.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, b) in key.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || (b == b'.' && i > 0);
        if keep {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Persistent metadata of a case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseMeta {
    /// Storage format version the case was written with.
    pub format_version: u32,
    /// Case name.
    pub name: String,
    /// Number of realizations.
    pub ensemble_size: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// One mounted case.
#[derive(Debug)]
pub struct CaseStore {
    meta: CaseMeta,
    dir: PathBuf,
    sync_on_write: bool,
    state_map: RwLock<StateMap>,
    time_map: RwLock<TimeMap>,
}

impl CaseStore {
    /// Returns true if `dir` holds a case.
    #[must_use]
    pub fn exists(dir: &Path) -> bool {
        dir.join(META_FILE).is_file()
    }

    /// Create a new case with an all-`Undefined` state map.
    pub fn create(
        dir: &Path,
        name: &str,
        ensemble_size: usize,
        format_version: u32,
        sync_on_write: bool,
    ) -> EnsembleResult<Self> {
        fs::create_dir_all(dir.join(PARAMETER_DIR)).map_err(|e| FileSystemError::io(dir, e))?;
        fs::create_dir_all(dir.join(RESPONSE_DIR)).map_err(|e| FileSystemError::io(dir, e))?;

        let meta = CaseMeta {
            format_version,
            name: name.to_string(),
            ensemble_size,
            created_at: Utc::now(),
        };
        let store = Self {
            meta,
            dir: dir.to_path_buf(),
            sync_on_write,
            state_map: RwLock::new(StateMap::new(ensemble_size)),
            time_map: RwLock::new(TimeMap::new()),
        };

        // Maps first: a directory with case.meta is a complete case.
        store.write(STATE_MAP_FILE, &StateMap::new(ensemble_size))?;
        store.write(TIME_MAP_FILE, &TimeMap::new())?;
        store.write(META_FILE, &store.meta)?;

        info!(case = %name, ensemble_size, "created case");
        Ok(store)
    }

    /// Mount an existing case, validating its format version and size.
    pub fn mount(
        dir: &Path,
        name: &str,
        ensemble_size: usize,
        expected_version: u32,
        sync_on_write: bool,
    ) -> EnsembleResult<Self> {
        let meta_path = dir.join(META_FILE);
        let meta: CaseMeta = codec::read_file(&meta_path).map_err(|e| read_err(&meta_path, e))?;

        if let Some(skew) = VersionSkew::classify(meta.format_version, expected_version) {
            return Err(FileSystemError::VersionMismatch {
                case: name.to_string(),
                found: meta.format_version,
                expected: expected_version,
                skew,
            }
            .into());
        }
        if meta.ensemble_size != ensemble_size {
            return Err(FileSystemError::EnsembleSizeMismatch {
                case: name.to_string(),
                found: meta.ensemble_size,
                expected: ensemble_size,
            }
            .into());
        }

        let state_path = dir.join(STATE_MAP_FILE);
        let state_map: StateMap = codec::read_file(&state_path).map_err(|e| read_err(&state_path, e))?;
        if state_map.len() != ensemble_size {
            return Err(FileSystemError::Corrupt {
                path: state_path,
                reason: format!(
                    "state map has {} entries, case metadata says {ensemble_size}",
                    state_map.len()
                ),
            }
            .into());
        }

        let time_path = dir.join(TIME_MAP_FILE);
        let time_map: TimeMap = match codec::read_file(&time_path) {
            Ok(map) => map,
            Err(e) if e.kind() == ErrorKind::NotFound => TimeMap::new(),
            Err(e) => return Err(read_err(&time_path, e).into()),
        };

        debug!(case = %name, "mounted case");
        Ok(Self {
            meta,
            dir: dir.to_path_buf(),
            sync_on_write,
            state_map: RwLock::new(state_map),
            time_map: RwLock::new(time_map),
        })
    }

    /// Case name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Case directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of realizations.
    #[must_use]
    pub fn ensemble_size(&self) -> usize {
        self.meta.ensemble_size
    }

    /// Persistent metadata.
    #[must_use]
    pub fn meta(&self) -> &CaseMeta {
        &self.meta
    }

    fn write<T: Serialize>(&self, file: &str, value: &T) -> Result<(), FileSystemError> {
        let path = self.dir.join(file);
        codec::write_file(&path, value, self.sync_on_write).map_err(|e| FileSystemError::io(path, e))
    }

    // State map

    /// Snapshot of the state map.
    pub fn state_map(&self) -> EnsembleResult<StateMap> {
        Ok(self.state_map.read().map_err(|_| lock_err("state_map"))?.clone())
    }

    /// State of one realization.
    pub fn state(&self, realization: usize) -> EnsembleResult<RealizationState> {
        let map = self.state_map.read().map_err(|_| lock_err("state_map"))?;
        map.get(realization).ok_or_else(|| {
            ValidationError::RealizationOutOfRange {
                realization,
                ensemble_size: map.len(),
            }
            .into()
        })
    }

    /// Set one realization's state; illegal transitions are rejected.
    pub fn set_state(&self, realization: usize, state: RealizationState) -> EnsembleResult<bool> {
        self.modify_state_map(|map| map.set(realization, state))
    }

    /// Apply `f` to the state map and persist the result if anything changed.
    ///
    /// `f` works on a copy; on error neither memory nor disk is modified.
    pub fn modify_state_map<T, F>(&self, f: F) -> EnsembleResult<T>
    where
        F: FnOnce(&mut StateMap) -> Result<T, ValidationError>,
    {
        let mut guard = self.state_map.write().map_err(|_| lock_err("state_map"))?;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        if next != *guard {
            self.write(STATE_MAP_FILE, &next)?;
            *guard = next;
        }
        Ok(out)
    }

    /// Returns true if at least one realization is `HasData`.
    pub fn has_data(&self) -> EnsembleResult<bool> {
        let map = self.state_map.read().map_err(|_| lock_err("state_map"))?;
        Ok(map.count(RealizationState::HasData) > 0)
    }

    // Time map

    /// Snapshot of the time map.
    pub fn time_map(&self) -> EnsembleResult<TimeMap> {
        Ok(self.time_map.read().map_err(|_| lock_err("time_map"))?.clone())
    }

    /// Record report-step dates starting at step 0.
    ///
    /// A step that already has a different date is a validation error.
    pub fn update_time_map(&self, dates: &[DateTime<Utc>]) -> EnsembleResult<bool> {
        let mut guard = self.time_map.write().map_err(|_| lock_err("time_map"))?;
        let mut next = guard.clone();
        let changed = next.update_all(dates)?;
        if changed {
            self.write(TIME_MAP_FILE, &next)?;
            *guard = next;
        }
        Ok(changed)
    }

    // Cells

    fn cell_path(&self, group: &str, key: &str, realization: usize, step: usize) -> PathBuf {
        self.dir
            .join(group)
            .join(escape_key(key))
            .join(format!("{realization}.{step}"))
    }

    fn check_realization(&self, realization: usize) -> Result<(), ValidationError> {
        if realization >= self.meta.ensemble_size {
            return Err(ValidationError::RealizationOutOfRange {
                realization,
                ensemble_size: self.meta.ensemble_size,
            });
        }
        Ok(())
    }

    fn save_cell(&self, path: PathBuf, values: &[f64]) -> EnsembleResult<()> {
        codec::write_file(&path, &values, self.sync_on_write)
            .map_err(|e| FileSystemError::io(path, e))?;
        Ok(())
    }

    fn load_cell(path: &Path) -> EnsembleResult<Vec<f64>> {
        Ok(codec::read_file(path).map_err(|e| read_err(path, e))?)
    }

    /// Store the values of one parameter for one realization.
    pub fn save_parameter(&self, key: &str, realization: usize, values: &[f64]) -> EnsembleResult<()> {
        self.check_realization(realization)?;
        self.save_cell(self.cell_path(PARAMETER_DIR, key, realization, PARAMETER_STEP), values)
    }

    /// Load the values of one parameter for one realization.
    pub fn load_parameter(&self, key: &str, realization: usize) -> EnsembleResult<Vec<f64>> {
        self.check_realization(realization)?;
        Self::load_cell(&self.cell_path(PARAMETER_DIR, key, realization, PARAMETER_STEP))
    }

    /// Returns true if a parameter cell exists.
    #[must_use]
    pub fn has_parameter(&self, key: &str, realization: usize) -> bool {
        self.cell_path(PARAMETER_DIR, key, realization, PARAMETER_STEP).is_file()
    }

    /// Store one response vector.
    pub fn save_response(
        &self,
        key: &str,
        realization: usize,
        step: usize,
        values: &[f64],
    ) -> EnsembleResult<()> {
        self.check_realization(realization)?;
        self.save_cell(self.cell_path(RESPONSE_DIR, key, realization, step), values)
    }

    /// Load one response vector.
    pub fn load_response(&self, key: &str, realization: usize, step: usize) -> EnsembleResult<Vec<f64>> {
        self.check_realization(realization)?;
        Self::load_cell(&self.cell_path(RESPONSE_DIR, key, realization, step))
    }

    /// Returns true if a response cell exists.
    #[must_use]
    pub fn has_response(&self, key: &str, realization: usize, step: usize) -> bool {
        self.cell_path(RESPONSE_DIR, key, realization, step).is_file()
    }

    /// Load a parameter for several realizations as a matrix.
    ///
    /// Rows are parameter values, columns follow `realizations` in order.
    pub fn load_parameter_matrix(&self, key: &str, realizations: &[usize]) -> EnsembleResult<Array2<f64>> {
        let mut columns = Vec::with_capacity(realizations.len());
        for &iens in realizations {
            columns.push(self.load_parameter(key, iens)?);
        }
        let rows = columns.first().map_or(0, Vec::len);
        let mut matrix = Array2::<f64>::zeros((rows, columns.len()));
        for (col, (values, &iens)) in columns.iter().zip(realizations).enumerate() {
            if values.len() != rows {
                return Err(ValidationError::ValueCountMismatch {
                    key: format!("{key}[{iens}]"),
                    expected: rows,
                    actual: values.len(),
                }
                .into());
            }
            for (row, v) in values.iter().enumerate() {
                matrix[[row, col]] = *v;
            }
        }
        Ok(matrix)
    }

    /// Store a parameter matrix, one column per realization.
    pub fn save_parameter_matrix(
        &self,
        key: &str,
        realizations: &[usize],
        matrix: &Array2<f64>,
    ) -> EnsembleResult<()> {
        if matrix.ncols() != realizations.len() {
            return Err(ValidationError::ValueCountMismatch {
                key: key.to_string(),
                expected: realizations.len(),
                actual: matrix.ncols(),
            }
            .into());
        }
        for (col, &iens) in realizations.iter().enumerate() {
            let values = matrix.column(col).to_vec();
            self.save_parameter(key, iens, &values)?;
        }
        Ok(())
    }

    /// Copy parameter cells into `target` for every masked realization.
    ///
    /// Realizations without a source cell are skipped. Target entries that
    /// received all keys advance to `Initialized`. Returns the number of
    /// realizations copied.
    pub fn copy_parameters_to(&self, target: &Self, keys: &[String], mask: &[bool]) -> EnsembleResult<usize> {
        if mask.len() != self.meta.ensemble_size {
            return Err(ValidationError::MaskLength {
                actual: mask.len(),
                expected: self.meta.ensemble_size,
            }
            .into());
        }
        if target.ensemble_size() != self.meta.ensemble_size {
            return Err(FileSystemError::EnsembleSizeMismatch {
                case: target.name().to_string(),
                found: target.ensemble_size(),
                expected: self.meta.ensemble_size,
            }
            .into());
        }

        let mut copied = Vec::new();
        for (iens, _) in mask.iter().enumerate().filter(|(_, active)| **active) {
            if !keys.iter().all(|key| self.has_parameter(key, iens)) {
                continue;
            }
            for key in keys {
                let values = self.load_parameter(key, iens)?;
                target.save_parameter(key, iens, &values)?;
            }
            copied.push(iens);
        }
        target.modify_state_map(|map| {
            for &iens in &copied {
                map.advance_to_initialized(iens)?;
            }
            Ok(())
        })?;

        debug!(source = %self.name(), target = %target.name(), copied = copied.len(), "copied parameters");
        Ok(copied.len())
    }

    /// Rewrite the in-memory maps to disk.
    pub fn sync(&self) -> EnsembleResult<()> {
        let state = self.state_map()?;
        self.write(STATE_MAP_FILE, &state)?;
        let time = self.time_map()?;
        self.write(TIME_MAP_FILE, &time)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EnsembleError;
    use tempfile::tempdir;

    fn new_case(dir: &Path, size: usize) -> CaseStore {
        CaseStore::create(&dir.join("default"), "default", size, CASE_FORMAT_VERSION, false).unwrap()
    }

    #[test]
    fn test_create_then_mount() {
        let dir = tempdir().unwrap();
        let case = new_case(dir.path(), 4);
        case.set_state(2, RealizationState::Initialized).unwrap();
        drop(case);

        let mounted =
            CaseStore::mount(&dir.path().join("default"), "default", 4, CASE_FORMAT_VERSION, false).unwrap();
        assert_eq!(mounted.state(2).unwrap(), RealizationState::Initialized);
        assert_eq!(mounted.state_map().unwrap().len(), 4);
    }

    #[test]
    fn test_mount_rejects_newer_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c");
        CaseStore::create(&path, "c", 2, CASE_FORMAT_VERSION + 1, false).unwrap();

        let err = CaseStore::mount(&path, "c", 2, CASE_FORMAT_VERSION, false).unwrap_err();
        assert!(err.is_file_system());
        assert!(err.to_string().contains("older"));
    }

    #[test]
    fn test_mount_rejects_size_change() {
        let dir = tempdir().unwrap();
        new_case(dir.path(), 3);
        let err = CaseStore::mount(&dir.path().join("default"), "default", 5, CASE_FORMAT_VERSION, false)
            .unwrap_err();
        assert!(matches!(
            err,
            EnsembleError::FileSystem(FileSystemError::EnsembleSizeMismatch { found: 3, expected: 5, .. })
        ));
    }

    #[test]
    fn test_illegal_transition_leaves_state() {
        let dir = tempdir().unwrap();
        let case = new_case(dir.path(), 1);
        case.set_state(0, RealizationState::Initialized).unwrap();
        assert!(case.set_state(0, RealizationState::Undefined).is_err());
        assert_eq!(case.state(0).unwrap(), RealizationState::Initialized);
    }

    #[test]
    fn test_parameter_cells_and_matrix() {
        let dir = tempdir().unwrap();
        let case = new_case(dir.path(), 3);
        case.save_parameter("KW:A", 0, &[1.0, 2.0]).unwrap();
        case.save_parameter("KW:A", 2, &[3.0, 4.0]).unwrap();

        let m = case.load_parameter_matrix("KW:A", &[0, 2]).unwrap();
        assert_eq!(m.shape(), &[2, 2]);
        assert_eq!(m[[1, 0]], 2.0);
        assert_eq!(m[[0, 1]], 3.0);
        assert!(!case.has_parameter("KW:A", 1));
        assert!(case.load_parameter("KW:A", 1).unwrap_err().is_file_system());
    }

    #[test]
    fn test_response_cells_by_step() {
        let dir = tempdir().unwrap();
        let case = new_case(dir.path(), 2);
        case.save_response("FOPR", 1, 3, &[0.5]).unwrap();
        assert_eq!(case.load_response("FOPR", 1, 3).unwrap(), vec![0.5]);
        assert!(!case.has_response("FOPR", 1, 2));
        assert!(case.save_response("FOPR", 2, 0, &[0.0]).is_err());
    }

    #[test]
    fn test_time_map_persists() {
        let dir = tempdir().unwrap();
        let case = new_case(dir.path(), 1);
        let d = Utc::now();
        assert!(case.update_time_map(&[d]).unwrap());
        drop(case);
        let mounted =
            CaseStore::mount(&dir.path().join("default"), "default", 1, CASE_FORMAT_VERSION, false).unwrap();
        assert_eq!(mounted.time_map().unwrap().get(0), Some(d));
    }

    #[test]
    fn test_copy_parameters_marks_initialized() {
        let dir = tempdir().unwrap();
        let source = new_case(dir.path(), 3);
        let target = CaseStore::create(&dir.path().join("t"), "t", 3, CASE_FORMAT_VERSION, false).unwrap();
        source.save_parameter("P", 0, &[1.0]).unwrap();
        source.save_parameter("P", 1, &[2.0]).unwrap();

        let copied = source
            .copy_parameters_to(&target, &["P".to_string()], &[true, false, true])
            .unwrap();
        assert_eq!(copied, 1);
        assert_eq!(target.load_parameter("P", 0).unwrap(), vec![1.0]);
        assert_eq!(target.state(0).unwrap(), RealizationState::Initialized);
        assert_eq!(target.state(1).unwrap(), RealizationState::Undefined);
        assert_eq!(target.state(2).unwrap(), RealizationState::Undefined);
    }

    #[test]
    fn test_escape_key() {
        assert_eq!(escape_key("SNAKE_OIL_PARAM"), "SNAKE_OIL_PARAM");
        assert_eq!(escape_key("a:b/c"), "a%3Ab%2Fc");
        assert_eq!(escape_key(".hidden"), "%2Ehidden");
    }
}
