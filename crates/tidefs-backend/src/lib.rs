#![warn(missing_docs)]

//! TideFS backend subsystem: the uniform object-store capability.
//!
//! Every remote store TideFS can mount (S3-compatible, Azure Blob, GCS, or a
//! local directory) is driven through the [`StorageBackend`] trait defined
//! here. The trait covers single-blob operations (head, ranged get, put,
//! copy, delete, rename) and the multipart upload group, and every backend
//! reports a [`Capabilities`] record so the filesystem core can adapt to
//! part-size limits, directory-marker schemes and server-side rename support.
//!
//! The crate also carries the pieces that sit directly in front of a backend:
//! retry with exponential backoff, the small/bulk throttle gates, key-space
//! mapping helpers, and vendor metadata normalisation. [`MemoryBackend`] is a
//! complete in-memory implementation used by tests and the local mount mode.

pub mod backend;
pub mod cancel;
pub mod capabilities;
pub mod error;
pub mod keys;
pub mod memory;
pub mod metadata;
pub mod retry;
pub mod throttle;
pub mod types;

pub use backend::{DynBackend, StorageBackend};
pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
pub use capabilities::{Capabilities, DirMarkerScheme};
pub use error::{BackendError, Result};
pub use memory::MemoryBackend;
pub use retry::{RetryConfig, RetryExecutor, RetryOutcome};
pub use throttle::{ThrottleConfig, ThrottleGates};
