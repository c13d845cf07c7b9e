//! Vendor metadata normalisation and the per-inode attribute keys.
//!
//! Each store prefixes user metadata differently (`x-amz-meta-` on S3,
//! `x-ms-meta-` on Azure, `x-goog-meta-` on GCS) and differs in casing
//! rules. Drivers hand the core raw header maps; everything above this
//! module sees bare lower-case keys only.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::types::BlobMetadata;

/// Metadata key holding the POSIX mode, as an octal string.
pub const META_MODE: &str = "mode";
/// Metadata key holding the owner uid, decimal.
pub const META_UID: &str = "uid";
/// Metadata key holding the owner gid, decimal.
pub const META_GID: &str = "gid";
/// Metadata key holding the mtime, unix seconds.
pub const META_MTIME: &str = "mtime";
/// Metadata key holding a symlink's target path.
pub const META_SYMLINK: &str = "symlink-target";
/// Metadata key marking a multipart upload as owned by a TideFS mount.
pub const META_FLUSH_OWNER: &str = "tidefs-mount";
/// Metadata key holding a rename forwarding pointer (instant-rename mode).
pub const META_FORWARD: &str = "tidefs-forward";

const VENDOR_PREFIXES: &[&str] = &["x-amz-meta-", "x-ms-meta-", "x-goog-meta-"];

/// Strips any vendor prefix and lower-cases a raw metadata key.
pub fn normalize_key(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    for prefix in VENDOR_PREFIXES {
        if let Some(rest) = lower.strip_prefix(prefix) {
            return rest.to_string();
        }
    }
    lower
}

/// Normalises an entire raw header map into core metadata.
///
/// Colliding keys after normalisation keep the first value seen; reserved
/// transport headers (anything still containing a `:`) are dropped.
pub fn normalize_map(raw: &HashMap<String, String>) -> BlobMetadata {
    let mut out = BlobMetadata::new();
    for (k, v) in raw {
        let key = normalize_key(k);
        if key.contains(':') {
            continue;
        }
        out.entry(key).or_insert_with(|| v.clone());
    }
    out
}

/// Builds the attribute metadata attached to every object the core writes.
pub fn attr_metadata(mode: u32, uid: u32, gid: u32, mtime: SystemTime) -> BlobMetadata {
    let mut meta = BlobMetadata::new();
    meta.insert(META_MODE.to_string(), format!("{:o}", mode));
    meta.insert(META_UID.to_string(), uid.to_string());
    meta.insert(META_GID.to_string(), gid.to_string());
    meta.insert(META_MTIME.to_string(), unix_secs(mtime).to_string());
    meta
}

/// Parses the stored mode, when present and well-formed.
pub fn parse_mode(meta: &BlobMetadata) -> Option<u32> {
    u32::from_str_radix(meta.get(META_MODE)?, 8).ok()
}

/// Parses a stored decimal id (`uid`/`gid`).
pub fn parse_id(meta: &BlobMetadata, key: &str) -> Option<u32> {
    meta.get(key)?.parse().ok()
}

/// Parses the stored mtime, when present and well-formed.
pub fn parse_mtime(meta: &BlobMetadata) -> Option<SystemTime> {
    let secs: u64 = meta.get(META_MTIME)?.parse().ok()?;
    Some(UNIX_EPOCH + Duration::from_secs(secs))
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
