//! Spill files for dirty buffers evicted under memory pressure.
//!
//! Spilled data lives in `spill-<inode>-<generation>` files inside the
//! configured spill directory. Files are removed when the last buffer
//! referencing them drops, cleaned wholesale on orderly unmount, and scanned
//! best-effort on startup to reap leftovers from a crashed mount.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{FsError, Result};

/// A spill file on disk. Dropping the last handle removes the file.
#[derive(Debug)]
pub struct SpillHandle {
    path: PathBuf,
    len: u64,
}

impl SpillHandle {
    /// Total bytes in the spill file.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the file holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the file, for diagnostics.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads `len` bytes starting at `offset` within the spill file.
    pub fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut file = fs::File::open(&self.path).map_err(|e| FsError::Io {
            message: format!("open spill {}: {}", self.path.display(), e),
        })?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| FsError::Io {
            message: format!("seek spill: {}", e),
        })?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).map_err(|e| FsError::Io {
            message: format!("read spill {}: {}", self.path.display(), e),
        })?;
        Ok(buf)
    }
}

impl Drop for SpillHandle {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove spill file {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Factory for spill files under one directory.
#[derive(Debug, Clone)]
pub struct SpillStore {
    dir: PathBuf,
}

impl SpillStore {
    /// Opens (creating if needed) a spill directory.
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| FsError::Io {
            message: format!("create spill dir {}: {}", dir.display(), e),
        })?;
        Ok(Self { dir })
    }

    /// Writes a buffer's bytes out, returning a shared handle.
    pub fn write(&self, ino: u64, generation: u64, data: &[u8]) -> Result<Arc<SpillHandle>> {
        let path = self.dir.join(format!("spill-{}-{}", ino, generation));
        let mut file = fs::File::create(&path).map_err(|e| FsError::Io {
            message: format!("create spill {}: {}", path.display(), e),
        })?;
        file.write_all(data).map_err(|e| FsError::Io {
            message: format!("write spill {}: {}", path.display(), e),
        })?;
        debug!("spilled {} bytes to {}", data.len(), path.display());
        Ok(Arc::new(SpillHandle {
            path,
            len: data.len() as u64,
        }))
    }

    /// Removes every spill file left behind by earlier runs.
    ///
    /// Best effort: unreadable entries are skipped with a warning. Returns
    /// the number of files reaped.
    pub fn scan_and_reap(&self) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) => {
                warn!("spill scan failed for {}: {}", self.dir.display(), e);
                return 0;
            }
        };
        let mut reaped = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("spill-") {
                if fs::remove_file(entry.path()).is_ok() {
                    reaped += 1;
                }
            }
        }
        if reaped > 0 {
            debug!("reaped {} stale spill files", reaped);
        }
        reaped
    }
}
