//! Durable, versioned case storage.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      StorageManager                          │
//! │   slot table (name -> slot, LRU)   current_case marker       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐                │
//! │  │ CaseStore  │ │ CaseStore  │ │ CaseStore  │   ...          │
//! │  └─────┬──────┘ └─────┬──────┘ └─────┬──────┘                │
//! │        └──────────────┼──────────────┘                       │
//! │                       ↓                                      │
//! │     codec (magic + len + json + crc32), AtomicFile           │
//! │                       ↓                                      │
//! │           FileLock on the storage root                       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod atomic;
mod case;
mod codec;
mod file_lock;
mod manager;

pub use atomic::{is_temp_file, write_bytes, AtomicFile};
pub use case::{CaseMeta, CaseStore, CASE_FORMAT_VERSION};
pub use file_lock::FileLock;
pub use manager::{StorageManager, CURRENT_CASE_FILE};
