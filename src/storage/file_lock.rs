//! Advisory file locking for a storage root.
//!
//! Only one storage manager may own a storage root at a time. The lock is
//! an exclusive `flock` (or `LockFileEx` on Windows) on a `.lock` file in
//! the root, held for the lifetime of the [`FileLock`].

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::StorageError;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Exclusive lock on a storage root.
///
/// Released when dropped.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Attempt to acquire the lock once, without waiting.
    ///
    /// # Errors
    /// - `ErrorKind::WouldBlock` if another process holds the lock
    /// - `ErrorKind::PermissionDenied` if we don't have write access
    pub fn acquire(dir: &Path) -> IoResult<Self> {
        let lock_path = dir.join(".lock");

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        Self::try_lock(&file)?;

        Ok(Self {
            _file: file,
            path: lock_path,
        })
    }

    /// Acquire the lock, polling until `timeout` elapses.
    ///
    /// Never proceeds without the lock: running out of time is a
    /// [`StorageError::LockTimeout`].
    pub fn acquire_with_timeout(dir: &Path, timeout: Duration) -> Result<Self, StorageError> {
        let started = Instant::now();
        loop {
            match Self::acquire(dir) {
                Ok(lock) => return Ok(lock),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(StorageError::LockTimeout {
                            path: dir.join(".lock"),
                            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                    tracing::debug!(root = %dir.display(), "storage root locked, waiting");
                    thread::sleep(POLL_INTERVAL.min(timeout - waited));
                }
                Err(source) => {
                    return Err(StorageError::Lock {
                        path: dir.to_path_buf(),
                        source,
                    })
                }
            }
        }
    }

    /// Returns the path to the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::unix::io::AsRawFd;

        let fd = file.as_raw_fd();
        // SAFETY: `fd` is a valid descriptor owned by `file` for the duration of the call.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let errno = IoError::last_os_error();
            if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(IoError::new(
                    ErrorKind::WouldBlock,
                    "storage root is locked by another process",
                ));
            }
            return Err(errno);
        }

        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
        };

        let handle = file.as_raw_handle() as HANDLE;
        // SAFETY: `handle` is owned by `file`; OVERLAPPED is plain data and may be zeroed.
        let result = unsafe {
            let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };

        if result == 0 {
            let err = IoError::last_os_error();
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("storage root is locked by another process: {err}"),
            ));
        }

        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> IoResult<()> {
        #[cfg(feature = "allow_no_lock")]
        {
            tracing::warn!("file locking not supported on this platform; proceeding without lock");
            Ok(())
        }

        #[cfg(not(feature = "allow_no_lock"))]
        {
            Err(IoError::new(
                ErrorKind::Unsupported,
                "file locking not supported on this platform",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_acquire_release() {
        let dir = tempdir().unwrap();

        {
            let lock = FileLock::acquire(dir.path()).unwrap();
            assert!(lock.path().exists());
        }
        FileLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn test_lock_prevents_double_acquire() {
        let dir = tempdir().unwrap();

        let _lock1 = FileLock::acquire(dir.path()).unwrap();

        let err = FileLock::acquire(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn test_timeout_reports_holder() {
        let dir = tempdir().unwrap();
        let _held = FileLock::acquire(dir.path()).unwrap();

        let err = FileLock::acquire_with_timeout(dir.path(), Duration::from_millis(60)).unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));
        assert!(err.to_string().contains("another process holds the lock"));
    }

    #[test]
    fn test_timeout_succeeds_after_release() {
        let dir = tempdir().unwrap();
        let held = FileLock::acquire(dir.path()).unwrap();
        let path = dir.path().to_path_buf();

        let waiter = thread::spawn(move || FileLock::acquire_with_timeout(&path, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        drop(held);

        assert!(waiter.join().unwrap().is_ok());
    }
}
