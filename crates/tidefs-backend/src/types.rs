//! Typed inputs and outputs for every backend operation.
//!
//! One struct pair per wire operation keeps the [`StorageBackend`] trait
//! signatures stable as backends grow optional fields.
//!
//! [`StorageBackend`]: crate::backend::StorageBackend

use std::collections::HashMap;
use std::time::SystemTime;

/// Free-form blob metadata, already vendor-normalised (see [`crate::metadata`]).
pub type BlobMetadata = HashMap<String, String>;

/// Input for `head_blob`.
#[derive(Debug, Clone)]
pub struct HeadBlobInput {
    /// Key to probe.
    pub key: String,
}

/// Output of `head_blob`.
#[derive(Debug, Clone)]
pub struct HeadBlobOutput {
    /// Key that was probed.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Backend object identity.
    pub etag: String,
    /// Last-modified time.
    pub mtime: SystemTime,
    /// Normalised user metadata.
    pub metadata: BlobMetadata,
    /// Backend storage class, when reported.
    pub storage_class: Option<String>,
    /// True when the object is a directory marker.
    pub is_dir_marker: bool,
}

/// Input for `list_blobs`.
#[derive(Debug, Clone, Default)]
pub struct ListBlobsInput {
    /// Restrict the listing to keys with this prefix.
    pub prefix: Option<String>,
    /// Group keys at this delimiter into common prefixes (usually `/`).
    pub delimiter: Option<String>,
    /// Continuation token from a previous truncated page.
    pub continuation: Option<String>,
    /// Maximum items per page; the backend may return fewer.
    pub max_keys: usize,
}

/// A single listed object.
#[derive(Debug, Clone)]
pub struct BlobItem {
    /// Full object key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Backend object identity.
    pub etag: String,
    /// Last-modified time.
    pub mtime: SystemTime,
    /// Backend storage class, when reported.
    pub storage_class: Option<String>,
}

/// Output of `list_blobs`.
#[derive(Debug, Clone, Default)]
pub struct ListBlobsOutput {
    /// Objects on this page. Sorted only when the backend advertises
    /// `sorted_listings`; the core re-sorts otherwise.
    pub items: Vec<BlobItem>,
    /// Common prefixes collapsed at the delimiter.
    pub common_prefixes: Vec<String>,
    /// Token for the next page, when truncated.
    pub next_continuation: Option<String>,
}

impl ListBlobsOutput {
    /// Whether more pages remain.
    pub fn is_truncated(&self) -> bool {
        self.next_continuation.is_some()
    }
}

/// Input for `get_blob`.
#[derive(Debug, Clone)]
pub struct GetBlobInput {
    /// Key to read.
    pub key: String,
    /// Byte range `(offset, length)`; `None` reads the whole object.
    pub range: Option<(u64, u64)>,
    /// Fail with `PreconditionFailed` unless the object still has this etag.
    pub if_match: Option<String>,
}

/// Output of `get_blob`.
#[derive(Debug, Clone)]
pub struct GetBlobOutput {
    /// The requested bytes (possibly shorter than the range at end of object).
    pub data: Vec<u8>,
    /// Total object size, independent of the range.
    pub size: u64,
    /// Backend object identity.
    pub etag: String,
    /// Normalised user metadata.
    pub metadata: BlobMetadata,
}

/// Input for `put_blob`.
#[derive(Debug, Clone)]
pub struct PutBlobInput {
    /// Destination key.
    pub key: String,
    /// Full object body.
    pub data: Vec<u8>,
    /// User metadata to attach.
    pub metadata: BlobMetadata,
    /// MIME type, when known.
    pub content_type: Option<String>,
    /// Storage class request, when supported.
    pub storage_class: Option<String>,
}

/// Output of `put_blob`.
#[derive(Debug, Clone)]
pub struct PutBlobOutput {
    /// Etag of the stored object.
    pub etag: String,
    /// Server-assigned modification time.
    pub mtime: SystemTime,
}

/// Input for `copy_blob`.
#[derive(Debug, Clone)]
pub struct CopyBlobInput {
    /// Source key.
    pub src: String,
    /// Destination key.
    pub dst: String,
    /// Replacement metadata; `None` preserves the source metadata.
    pub metadata: Option<BlobMetadata>,
    /// Storage class for the destination, when supported.
    pub storage_class: Option<String>,
}

/// Output of `copy_blob`.
#[derive(Debug, Clone)]
pub struct CopyBlobOutput {
    /// Etag of the destination object.
    pub etag: String,
}

/// Input for `rename_blob` (server-side rename, where supported).
#[derive(Debug, Clone)]
pub struct RenameBlobInput {
    /// Source key.
    pub src: String,
    /// Destination key.
    pub dst: String,
}

/// Input for `multipart_begin`.
#[derive(Debug, Clone)]
pub struct MultipartBeginInput {
    /// Destination key.
    pub key: String,
    /// Metadata snapshot taken at upload start.
    pub metadata: BlobMetadata,
    /// MIME type, when known.
    pub content_type: Option<String>,
}

/// Output of `multipart_begin`.
#[derive(Debug, Clone)]
pub struct MultipartBeginOutput {
    /// Backend-issued upload identifier.
    pub upload_id: String,
}

/// Input for `multipart_add`.
#[derive(Debug, Clone)]
pub struct MultipartAddInput {
    /// Destination key.
    pub key: String,
    /// Upload this part belongs to.
    pub upload_id: String,
    /// Monotonic part number, starting at 1.
    pub part_number: u32,
    /// Part body.
    pub data: Vec<u8>,
}

/// Output of `multipart_add`.
#[derive(Debug, Clone)]
pub struct MultipartAddOutput {
    /// Etag of the uploaded part.
    pub etag: String,
}

/// Input for `multipart_copy` (server-side part-by-copy).
#[derive(Debug, Clone)]
pub struct MultipartCopyInput {
    /// Key of the existing source object.
    pub src: String,
    /// Destination key of the upload.
    pub key: String,
    /// Upload this part belongs to.
    pub upload_id: String,
    /// Monotonic part number, starting at 1.
    pub part_number: u32,
    /// Byte offset in the source object.
    pub src_offset: u64,
    /// Byte count to copy.
    pub len: u64,
}

/// Output of `multipart_copy`.
#[derive(Debug, Clone)]
pub struct MultipartCopyOutput {
    /// Etag of the copied part.
    pub etag: String,
}

/// Input for `multipart_commit`.
#[derive(Debug, Clone)]
pub struct MultipartCommitInput {
    /// Destination key.
    pub key: String,
    /// Upload to commit.
    pub upload_id: String,
    /// `(part_number, etag)` pairs in ascending part order.
    pub parts: Vec<(u32, String)>,
}

/// Output of `multipart_commit`.
#[derive(Debug, Clone)]
pub struct MultipartCommitOutput {
    /// Etag of the committed object (multipart shape, not a body digest).
    pub etag: String,
    /// Server-assigned modification time.
    pub mtime: SystemTime,
}

/// Input for `multipart_abort`.
#[derive(Debug, Clone)]
pub struct MultipartAbortInput {
    /// Destination key.
    pub key: String,
    /// Upload to abort.
    pub upload_id: String,
}

/// An in-progress multipart upload, as reported by `list_multipart_uploads`.
#[derive(Debug, Clone)]
pub struct MultipartUploadInfo {
    /// Destination key.
    pub key: String,
    /// Upload identifier.
    pub upload_id: String,
    /// Metadata snapshot given at begin.
    pub metadata: BlobMetadata,
    /// When the upload was started.
    pub started: SystemTime,
}
