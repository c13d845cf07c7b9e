//! File attributes and conversion helpers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tidefs_backend::metadata;
use tidefs_backend::types::BlobMetadata;

use crate::inode::InodeKind;

/// Attribute block returned by `getattr`/`lookup`, kernel-shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    /// Inode id.
    pub ino: u64,
    /// Logical size in bytes.
    pub size: u64,
    /// 512-byte blocks, for `st_blocks`.
    pub blocks: u64,
    /// Access time.
    pub atime: SystemTime,
    /// Modification time.
    pub mtime: SystemTime,
    /// Status-change time.
    pub ctime: SystemTime,
    /// File type.
    pub kind: InodeKind,
    /// Permission bits.
    pub mode: u32,
    /// Link count.
    pub nlink: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
}

/// Blocks of 512 bytes needed for a byte size.
pub fn blocks_for_size(size: u64) -> u64 {
    size.div_ceil(512)
}

/// Applies the umask to a requested create mode.
pub fn apply_mode_umask(mode: u32, umask: u32) -> u32 {
    mode & !umask & 0o7777
}

/// Default mode for a freshly created inode of the given kind.
pub fn default_mode(kind: InodeKind) -> u32 {
    match kind {
        InodeKind::Directory => 0o755,
        InodeKind::Symlink => 0o777,
        InodeKind::File => 0o644,
    }
}

/// Extracts stored attributes from object metadata, with fallbacks.
///
/// Objects written by other clients carry no attribute metadata; those get
/// the mount's defaults and the backend mtime.
pub fn attrs_from_metadata(
    meta: &BlobMetadata,
    kind: InodeKind,
    backend_mtime: SystemTime,
    default_uid: u32,
    default_gid: u32,
) -> (u32, u32, u32, SystemTime) {
    let mode = metadata::parse_mode(meta).unwrap_or_else(|| default_mode(kind));
    let uid = metadata::parse_id(meta, metadata::META_UID).unwrap_or(default_uid);
    let gid = metadata::parse_id(meta, metadata::META_GID).unwrap_or(default_gid);
    let mtime = metadata::parse_mtime(meta).unwrap_or(backend_mtime);
    (mode, uid, gid, mtime)
}

/// Unix seconds for a `SystemTime`, saturating at the epoch.
pub fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// `SystemTime` from unix seconds.
pub fn from_unix_secs(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}
