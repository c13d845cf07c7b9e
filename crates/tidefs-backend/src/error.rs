//! Backend error taxonomy and its POSIX errno mapping.

use thiserror::Error;

/// Errors returned by object-store backends.
///
/// Each variant corresponds to one entry of the error taxonomy the
/// filesystem core surfaces to the kernel. Transport-level details stay in
/// the message; callers branch on the variant only.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The requested key does not exist.
    #[error("key not found: {key}")]
    NotFound {
        /// Key that was requested.
        key: String,
    },

    /// Authentication or authorization failure.
    #[error("permission denied for {op} on {key}")]
    Permission {
        /// Key the operation targeted.
        key: String,
        /// Operation name (head, get, put, ...).
        op: &'static str,
    },

    /// Temporary condition (throttling, 5xx, connection reset); retryable.
    #[error("backend busy: {reason}")]
    Busy {
        /// Human-readable throttle/overload reason.
        reason: String,
    },

    /// The backend lacks this capability (e.g. server-side rename).
    #[error("operation not supported: {op}")]
    NotSupported {
        /// Operation name.
        op: &'static str,
    },

    /// Create clashed with an existing key.
    #[error("key already exists: {key}")]
    Exists {
        /// Conflicting key.
        key: String,
    },

    /// A backend limit was exceeded and cannot be worked around.
    #[error("{key}: size {size} exceeds backend limit {limit}")]
    TooLarge {
        /// Key the operation targeted.
        key: String,
        /// Requested size.
        size: u64,
        /// Backend limit.
        limit: u64,
    },

    /// Network or transport failure.
    #[error("I/O failure: {message}")]
    Io {
        /// Transport diagnostic.
        message: String,
    },

    /// Malformed input or constraint violation.
    #[error("invalid request: {message}")]
    Invalid {
        /// What was malformed.
        message: String,
    },

    /// Conditional request failed (`If-Match` etag mismatch).
    ///
    /// The caller discards its cached etag and retries the read.
    #[error("precondition failed for {key}: etag {expected} no longer current")]
    PreconditionFailed {
        /// Key the condition applied to.
        key: String,
        /// The etag the caller expected.
        expected: String,
    },
}

/// Result alias for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

impl BackendError {
    /// Maps the error to the POSIX errno reported to the kernel.
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            BackendError::NotFound { .. } => ENOENT,
            BackendError::Permission { .. } => EACCES,
            BackendError::Busy { .. } => EAGAIN,
            BackendError::NotSupported { .. } => ENOTSUP,
            BackendError::Exists { .. } => EEXIST,
            BackendError::TooLarge { .. } => EFBIG,
            BackendError::Io { .. } => EIO,
            BackendError::Invalid { .. } => EINVAL,
            BackendError::PreconditionFailed { .. } => EAGAIN,
        }
    }

    /// Whether the retry layer may re-issue the operation.
    ///
    /// Permanent failures (NotFound, Permission, Invalid, ...) must surface
    /// immediately; only throttling, transport faults and failed
    /// preconditions are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Busy { .. }
                | BackendError::Io { .. }
                | BackendError::PreconditionFailed { .. }
        )
    }

    /// Shorthand for a transport failure.
    pub fn io<S: Into<String>>(message: S) -> Self {
        BackendError::Io {
            message: message.into(),
        }
    }

    /// Shorthand for a malformed-input failure.
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        BackendError::Invalid {
            message: message.into(),
        }
    }
}
