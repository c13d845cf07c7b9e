//! The uniform object-store trait consumed by the filesystem core.

use std::sync::Arc;

use async_trait::async_trait;

use crate::capabilities::Capabilities;
use crate::error::Result;
use crate::types::*;

/// Uniform object-store interface.
///
/// Implementations are cheap to share behind an [`Arc`]; all operations are
/// `&self` and internally synchronised. Every method is a suspension point
/// and is always awaited outside filesystem locks.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// The backend's capability record.
    fn capabilities(&self) -> Capabilities;

    /// Probes a single key for existence and metadata.
    async fn head_blob(&self, input: HeadBlobInput) -> Result<HeadBlobOutput>;

    /// Lists one page of keys under a prefix.
    async fn list_blobs(&self, input: ListBlobsInput) -> Result<ListBlobsOutput>;

    /// Reads an object, optionally a byte range, optionally etag-conditional.
    async fn get_blob(&self, input: GetBlobInput) -> Result<GetBlobOutput>;

    /// Writes a whole object in one request.
    async fn put_blob(&self, input: PutBlobInput) -> Result<PutBlobOutput>;

    /// Copies an object server-side.
    async fn copy_blob(&self, input: CopyBlobInput) -> Result<CopyBlobOutput>;

    /// Deletes a single key. Deleting an absent key reports `NotFound`.
    async fn delete_blob(&self, key: &str) -> Result<()>;

    /// Deletes a batch of keys; absent keys are skipped silently.
    async fn delete_blobs(&self, keys: &[String]) -> Result<()>;

    /// Server-side rename. Backends without the capability return
    /// `NotSupported` and the caller falls back to copy + delete.
    async fn rename_blob(&self, input: RenameBlobInput) -> Result<()>;

    /// Starts a multipart upload.
    async fn multipart_begin(&self, input: MultipartBeginInput) -> Result<MultipartBeginOutput>;

    /// Uploads one part.
    async fn multipart_add(&self, input: MultipartAddInput) -> Result<MultipartAddOutput>;

    /// Copies a byte range of an existing object in as one part.
    async fn multipart_copy(&self, input: MultipartCopyInput) -> Result<MultipartCopyOutput>;

    /// Commits the upload, making the object visible atomically.
    async fn multipart_commit(&self, input: MultipartCommitInput) -> Result<MultipartCommitOutput>;

    /// Aborts the upload and discards its parts. Idempotent.
    async fn multipart_abort(&self, input: MultipartAbortInput) -> Result<()>;

    /// Lists in-progress multipart uploads, for the startup expiry sweep.
    async fn list_multipart_uploads(&self, prefix: &str) -> Result<Vec<MultipartUploadInfo>>;
}

/// Shared handle to a backend, as injected into the filesystem core.
pub type DynBackend = Arc<dyn StorageBackend>;
