//! Storage manager: the set of mounted cases under one storage root.
//!
//! Handles live in an index-based slot table (`name -> slot`). At most
//! `max_resident_cases` slots are occupied; when another case must be
//! mounted, the least-recently-accessed case other than the active one is
//! flushed and released. Only the handle goes away, the data stays on disk.
//!
//! The storage root is locked for the manager's lifetime, so no other
//! process can mount the same cases concurrently.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

use super::atomic;
use super::case::{CaseStore, CASE_FORMAT_VERSION};
use super::file_lock::FileLock;
use crate::config::{StorageConfig, DEFAULT_CASE_NAME};
use crate::error::{ConfigurationError, EnsembleError, EnsembleResult, FileSystemError, ValidationError};
use crate::realization::StateMap;

/// Plain-text file naming the active case.
pub const CURRENT_CASE_FILE: &str = "current_case";

static CASE_NAME_RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn validate_case_name(name: &str) -> Result<(), EnsembleError> {
    let re = CASE_NAME_RE
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]{0,254}$"))
        .as_ref()
        .map_err(|e| EnsembleError::internal(format!("case name pattern: {e}")))?;
    if re.is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::InvalidCaseName {
            name: name.to_string(),
            reason: "use letters, digits, '_', '-' or '.', not starting with '.' or '-'".to_string(),
        }
        .into())
    }
}

struct Slot {
    case: Arc<CaseStore>,
    last_access: u64,
}

/// Owner of all mounted cases under a storage root.
pub struct StorageManager {
    config: StorageConfig,
    format_version: u32,
    _lock: FileLock,
    slots: Vec<Option<Slot>>,
    index: HashMap<String, usize>,
    /// Evicted handles, reused on remount while a caller still holds them.
    retired: HashMap<String, Weak<CaseStore>>,
    active: String,
    tick: u64,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("root", &self.config.root)
            .field("active", &self.active)
            .field("resident", &self.index.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl StorageManager {
    /// Open a storage root, creating it if necessary.
    ///
    /// Acquires the root lock (waiting up to `lock_timeout_ms`), then mounts
    /// the case named by the `current_case` marker, or `default` if there is
    /// no marker yet.
    pub fn open(config: StorageConfig) -> EnsembleResult<Self> {
        Self::open_with_format_version(config, CASE_FORMAT_VERSION)
    }

    /// [`Self::open`] with an explicit storage format version.
    ///
    /// New cases are written with `format_version` and existing cases must
    /// match it.
    pub fn open_with_format_version(config: StorageConfig, format_version: u32) -> EnsembleResult<Self> {
        let config = config.validate()?;
        fs::create_dir_all(&config.root).map_err(|e| FileSystemError::io(&config.root, e))?;
        let lock = FileLock::acquire_with_timeout(&config.root, Duration::from_millis(config.lock_timeout_ms))?;

        let marker = config.root.join(CURRENT_CASE_FILE);
        let active = match fs::read_to_string(&marker) {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => DEFAULT_CASE_NAME.to_string(),
            Err(e) if e.kind() == ErrorKind::NotFound => DEFAULT_CASE_NAME.to_string(),
            Err(e) => return Err(FileSystemError::io(marker, e).into()),
        };

        let mut manager = Self {
            config,
            format_version,
            _lock: lock,
            slots: Vec::new(),
            index: HashMap::new(),
            retired: HashMap::new(),
            active: String::new(),
            tick: 0,
        };
        manager.open_or_create(&active)?;
        manager.active = active;
        manager.write_marker()?;

        info!(root = %manager.config.root.display(), case = %manager.active, "opened storage");
        Ok(manager)
    }

    /// Storage root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Number of realizations in every case.
    #[must_use]
    pub fn ensemble_size(&self) -> usize {
        self.config.ensemble_size
    }

    /// Storage format version this manager reads and writes.
    #[must_use]
    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    fn case_dir(&self, name: &str) -> PathBuf {
        self.config.root.join(name)
    }

    fn write_marker(&self) -> EnsembleResult<()> {
        let marker = self.config.root.join(CURRENT_CASE_FILE);
        atomic::write_bytes(&marker, self.active.as_bytes(), self.config.sync_on_write)
            .map_err(|e| FileSystemError::io(marker, e))?;
        Ok(())
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Return the mounted handle for `name`, mounting or creating it.
    ///
    /// Existing cases are checked for format version and ensemble size.
    pub fn open_or_create(&mut self, name: &str) -> EnsembleResult<Arc<CaseStore>> {
        validate_case_name(name)?;
        let tick = self.next_tick();

        if let Some(slot) = self.index.get(name).and_then(|&i| self.slots[i].as_mut()) {
            slot.last_access = tick;
            return Ok(Arc::clone(&slot.case));
        }

        let case = match self.retired.remove(name).and_then(|weak| weak.upgrade()) {
            Some(case) => {
                debug!(case = %name, "reusing live handle");
                case
            }
            None => Arc::new(self.mount_or_create(name)?),
        };

        self.make_room()?;
        if self.index.len() < self.config.max_resident_cases {
            self.insert(name, Arc::clone(&case), tick);
        } else {
            // Every resident handle is the active case; hand this one out unretained.
            self.retired.insert(name.to_string(), Arc::downgrade(&case));
        }
        Ok(case)
    }

    fn mount_or_create(&self, name: &str) -> EnsembleResult<CaseStore> {
        let dir = self.case_dir(name);
        let size = self.config.ensemble_size;
        let sync = self.config.sync_on_write;
        if CaseStore::exists(&dir) {
            CaseStore::mount(&dir, name, size, self.format_version, sync)
        } else {
            CaseStore::create(&dir, name, size, self.format_version, sync)
        }
    }

    fn insert(&mut self, name: &str, case: Arc<CaseStore>, tick: u64) {
        let slot = Slot {
            case,
            last_access: tick,
        };
        let idx = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(slot);
                free
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(name.to_string(), idx);
    }

    /// Evict handles until one more fits, never touching the active case.
    fn make_room(&mut self) -> EnsembleResult<()> {
        while self.index.len() >= self.config.max_resident_cases {
            let victim = self
                .index
                .iter()
                .filter(|(name, _)| **name != self.active)
                .filter_map(|(name, &i)| self.slots[i].as_ref().map(|s| (name.clone(), i, s.last_access)))
                .min_by_key(|(_, _, last)| *last);

            let Some((name, idx, _)) = victim else {
                return Ok(());
            };
            self.index.remove(&name);
            if let Some(slot) = self.slots[idx].take() {
                self.retired.insert(name.clone(), Arc::downgrade(&slot.case));
                slot.case.sync()?;
            }
            debug!(case = %name, "evicted case handle");
        }
        self.retired.retain(|_, weak| weak.strong_count() > 0);
        Ok(())
    }

    /// Name of the active case.
    #[must_use]
    pub fn active_case(&self) -> &str {
        &self.active
    }

    /// Handle of the active case, remounting it if needed.
    pub fn active(&mut self) -> EnsembleResult<Arc<CaseStore>> {
        let name = self.active.clone();
        self.open_or_create(&name)
    }

    /// Make an existing case the active one and persist the choice.
    ///
    /// Unknown names fail with a lookup error listing the known cases.
    pub fn set_active_case(&mut self, name: &str) -> EnsembleResult<Arc<CaseStore>> {
        if !self.contains(name) {
            return Err(ConfigurationError::UnknownCase {
                name: name.to_string(),
                known: self.cases()?,
            }
            .into());
        }
        let case = self.open_or_create(name)?;
        self.active = name.to_string();
        self.write_marker()?;
        // The new active case may have been handed out unretained.
        if !self.index.contains_key(name) {
            self.make_room()?;
            let tick = self.next_tick();
            self.insert(name, Arc::clone(&case), tick);
        }
        info!(case = %name, "switched active case");
        Ok(case)
    }

    /// Returns true if a case with this name exists on disk (or is mounted).
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
            || (validate_case_name(name).is_ok() && CaseStore::exists(&self.case_dir(name)))
    }

    /// Returns true if the case exists and has at least one `HasData` entry.
    pub fn has_data(&mut self, name: &str) -> EnsembleResult<bool> {
        if !self.contains(name) {
            return Ok(false);
        }
        self.open_or_create(name)?.has_data()
    }

    /// Names of all cases on disk, sorted.
    pub fn cases(&self) -> EnsembleResult<Vec<String>> {
        let root = &self.config.root;
        let mut names = Vec::new();
        for entry in fs::read_dir(root).map_err(|e| FileSystemError::io(root, e))? {
            let entry = entry.map_err(|e| FileSystemError::io(root, e))?;
            let path = entry.path();
            if !CaseStore::exists(&path) {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Number of occupied handle slots.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.index.len()
    }

    /// Returns true if `name` currently occupies a slot.
    #[must_use]
    pub fn is_resident(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// State map of a case, mounting it if needed.
    pub fn state_map(&mut self, name: &str) -> EnsembleResult<StateMap> {
        if !self.contains(name) {
            return Err(ConfigurationError::UnknownCase {
                name: name.to_string(),
                known: self.cases()?,
            }
            .into());
        }
        self.open_or_create(name)?.state_map()
    }

    /// Sync every resident case.
    pub fn flush(&self) -> EnsembleResult<()> {
        for slot in self.slots.iter().flatten() {
            slot.case.sync()?;
        }
        Ok(())
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "failed to flush cases on close");
        }
    }
}
