//! Backend capability record.
//!
//! The filesystem core never branches on a backend's concrete type; it reads
//! this record once at mount and adapts part sizing, rename strategy and
//! directory materialisation to what the store can do.

use serde::{Deserialize, Serialize};

/// How a backend represents an empty directory in a flat key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirMarkerScheme {
    /// Directories exist only implicitly as common key prefixes.
    None,
    /// A zero-byte object whose key ends in `/` marks the directory.
    TrailingSlash,
    /// A regular object carrying a backend-specific metadata flag.
    MetadataFlag,
}

/// What an object store can do, reported once per backend instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Short backend name for diagnostics ("s3", "azblob", "gcs", "memory").
    pub name: String,
    /// Smallest allowed multipart part, except the final part.
    pub min_part_size: u64,
    /// Largest allowed multipart part.
    pub max_part_size: u64,
    /// Maximum part count per upload.
    pub max_parts: u32,
    /// Largest object accepted by a single `put_blob`.
    pub max_put_size: u64,
    /// Page limit for `list_blobs`.
    pub max_list_page: usize,
    /// Whether the backend has a server-side rename operation.
    pub server_rename: bool,
    /// Whether the backend can copy objects server-side.
    pub server_copy: bool,
    /// Whether a repeated `copy_blob` with identical arguments is harmless.
    pub idempotent_copy: bool,
    /// Whether `list_blobs` pages arrive in lexicographic key order.
    pub sorted_listings: bool,
    /// How empty directories are materialised.
    pub dir_markers: DirMarkerScheme,
    /// Whether the backend verifies part/object checksums server-side.
    pub server_checksum: bool,
    /// Whether server-side encryption options can be requested.
    pub sse: bool,
}

impl Capabilities {
    /// Conservative defaults matching an S3-compatible store.
    pub fn s3_defaults(name: &str) -> Self {
        Self {
            name: name.to_string(),
            min_part_size: 5 * 1024 * 1024,
            max_part_size: 5 * 1024 * 1024 * 1024,
            max_parts: 10_000,
            max_put_size: 5 * 1024 * 1024 * 1024,
            max_list_page: 1000,
            server_rename: false,
            server_copy: true,
            idempotent_copy: true,
            sorted_listings: true,
            dir_markers: DirMarkerScheme::TrailingSlash,
            server_checksum: true,
            sse: true,
        }
    }

    /// Largest object representable through multipart on this backend.
    pub fn max_object_size(&self) -> u64 {
        self.max_part_size.saturating_mul(self.max_parts as u64)
    }

    /// Clamps a requested part size into the backend's legal range.
    pub fn clamp_part_size(&self, requested: u64) -> u64 {
        requested.clamp(self.min_part_size, self.max_part_size)
    }
}
