//! Write-to-temp-then-rename file replacement.
//!
//! Readers of a case directory only ever see a complete old file or a
//! complete new file, never a torn write.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Marker embedded in temporary file names.
pub const TEMP_MARKER: &str = ".tmp.";

/// A file that becomes visible at its final path only on [`AtomicFile::commit`].
pub struct AtomicFile {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl AtomicFile {
    /// Start writing a replacement for `final_path`.
    ///
    /// The temporary file lives next to the target so the rename stays on
    /// one file system.
    pub fn create(final_path: &Path) -> IoResult<Self> {
        let parent = final_path
            .parent()
            .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "path has no parent directory"))?;
        let file_name = final_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "path has no file name"))?;
        fs::create_dir_all(parent)?;

        let temp_path = parent.join(format!(".{file_name}{TEMP_MARKER}{}", Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        Ok(Self {
            temp_path: Some(temp_path),
            final_path: final_path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
        })
    }

    /// Flush, optionally fsync, and rename into place.
    ///
    /// This is the commit point: after it returns the new content is the
    /// only content visible at the final path.
    pub fn commit(mut self, sync: bool) -> IoResult<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "writer already consumed"))?;
        let temp_path = self
            .temp_path
            .take()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "temp_path already consumed"))?;

        writer.flush()?;
        if sync {
            writer.get_ref().sync_all()?;
        }
        drop(writer);

        if let Err(e) = fs::rename(&temp_path, &self.final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        Ok(())
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.writer
            .as_mut()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "writer already consumed"))?
            .write(buf)
    }

    fn flush(&mut self) -> IoResult<()> {
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        // Uncommitted: discard the temp file.
        self.writer.take();
        if let Some(ref temp_path) = self.temp_path {
            if temp_path.exists() {
                let _ = fs::remove_file(temp_path);
            }
        }
    }
}

/// Atomically replace `path` with `bytes`.
pub fn write_bytes(path: &Path, bytes: &[u8], sync: bool) -> IoResult<()> {
    let mut file = AtomicFile::create(path)?;
    file.write_all(bytes)?;
    file.commit(sync)
}

/// Returns true for leftovers of an interrupted [`AtomicFile`].
#[must_use]
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && n.contains(TEMP_MARKER))
}
