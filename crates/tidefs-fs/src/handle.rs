//! Open file handle tracking.

use std::collections::HashMap;

use crate::inode::InodeId;

/// Opaque handle id returned to the kernel.
pub type FileHandle = u64;

/// Access mode of an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFlags {
    /// Reads only.
    ReadOnly,
    /// Writes only.
    WriteOnly,
    /// Reads and writes.
    ReadWrite,
}

impl OpenFlags {
    /// Whether reads are allowed through this handle.
    pub fn is_readable(&self) -> bool {
        matches!(self, OpenFlags::ReadOnly | OpenFlags::ReadWrite)
    }

    /// Whether writes are allowed through this handle.
    pub fn is_writable(&self) -> bool {
        matches!(self, OpenFlags::WriteOnly | OpenFlags::ReadWrite)
    }

    /// Decodes the access bits of libc open flags.
    pub fn from_libc(flags: i32) -> Self {
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => OpenFlags::WriteOnly,
            libc::O_RDWR => OpenFlags::ReadWrite,
            _ => OpenFlags::ReadOnly,
        }
    }
}

/// One open handle.
#[derive(Debug, Clone)]
pub struct HandleEntry {
    /// Handle id.
    pub fh: FileHandle,
    /// Inode the handle refers to.
    pub ino: InodeId,
    /// Access mode.
    pub flags: OpenFlags,
}

/// Table of all open handles for one mount.
pub struct HandleTable {
    next_fh: FileHandle,
    entries: HashMap<FileHandle, HandleEntry>,
}

impl HandleTable {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            next_fh: 1,
            entries: HashMap::new(),
        }
    }

    /// Issues a handle for an inode.
    pub fn open(&mut self, ino: InodeId, flags: OpenFlags) -> FileHandle {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.entries.insert(fh, HandleEntry { fh, ino, flags });
        tracing::debug!("opened handle fh={} ino={} flags={:?}", fh, ino, flags);
        fh
    }

    /// Looks up a handle.
    pub fn get(&self, fh: FileHandle) -> Option<&HandleEntry> {
        self.entries.get(&fh)
    }

    /// Closes a handle, returning its entry.
    pub fn close(&mut self, fh: FileHandle) -> Option<HandleEntry> {
        let entry = self.entries.remove(&fh);
        if entry.is_some() {
            tracing::debug!("closed handle fh={}", fh);
        }
        entry
    }

    /// Open handles on an inode.
    pub fn handles_for_inode(&self, ino: InodeId) -> Vec<FileHandle> {
        self.entries
            .values()
            .filter(|e| e.ino == ino)
            .map(|e| e.fh)
            .collect()
    }

    /// Total open handles.
    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
