//! Filesystem error type and errno mapping.

use thiserror::Error;
use tidefs_backend::BackendError;

/// Errors surfaced by the filesystem core.
#[derive(Debug, Error)]
pub enum FsError {
    /// Inode or name does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Inode id or path component that was missing.
        what: String,
    },

    /// Operation forbidden (including writes through read-only handles).
    #[error("permission denied: {op}")]
    Permission {
        /// The rejected operation.
        op: &'static str,
    },

    /// Temporary condition; the caller may retry.
    #[error("resource busy: {reason}")]
    Busy {
        /// Why the operation cannot proceed right now.
        reason: String,
    },

    /// The mounted backend lacks the capability.
    #[error("operation not supported: {op}")]
    NotSupported {
        /// The unsupported operation.
        op: &'static str,
    },

    /// Name collision on create or rename.
    #[error("already exists: {name}")]
    Exists {
        /// The clashing name.
        name: String,
    },

    /// Target is not a directory.
    #[error("not a directory: inode {ino}")]
    NotDirectory {
        /// Offending inode.
        ino: u64,
    },

    /// Target is a directory where a file was required.
    #[error("is a directory: inode {ino}")]
    IsDirectory {
        /// Offending inode.
        ino: u64,
    },

    /// Directory is not empty.
    #[error("directory not empty: inode {ino}")]
    NotEmpty {
        /// Offending inode.
        ino: u64,
    },

    /// File or object exceeds a backend limit.
    #[error("too large: {size} exceeds {limit}")]
    TooLarge {
        /// Requested size.
        size: u64,
        /// The limit it crossed.
        limit: u64,
    },

    /// Backend I/O failed after retries were exhausted.
    #[error("I/O error: {message}")]
    Io {
        /// Diagnostic carried from the backend.
        message: String,
    },

    /// Malformed argument or violated constraint.
    #[error("invalid argument: {message}")]
    Invalid {
        /// What was malformed.
        message: String,
    },

    /// Handle is stale or was never issued.
    #[error("bad file handle: {fh}")]
    BadHandle {
        /// Offending handle.
        fh: u64,
    },
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    /// Maps the error to the POSIX errno reported to the kernel.
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            FsError::NotFound { .. } => ENOENT,
            FsError::Permission { .. } => EACCES,
            FsError::Busy { .. } => EAGAIN,
            FsError::NotSupported { .. } => ENOTSUP,
            FsError::Exists { .. } => EEXIST,
            FsError::NotDirectory { .. } => ENOTDIR,
            FsError::IsDirectory { .. } => EISDIR,
            FsError::NotEmpty { .. } => ENOTEMPTY,
            FsError::TooLarge { .. } => EFBIG,
            FsError::Io { .. } => EIO,
            FsError::Invalid { .. } => EINVAL,
            FsError::BadHandle { .. } => EBADF,
        }
    }

    /// Shorthand for a missing name under a parent.
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        FsError::NotFound { what: what.into() }
    }

    /// Shorthand for an invalid-argument failure.
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        FsError::Invalid {
            message: message.into(),
        }
    }
}

impl From<BackendError> for FsError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound { key } => FsError::NotFound { what: key },
            BackendError::Permission { op, .. } => FsError::Permission { op },
            BackendError::Busy { reason } => FsError::Busy { reason },
            BackendError::NotSupported { op } => FsError::NotSupported { op },
            BackendError::Exists { key } => FsError::Exists { name: key },
            BackendError::TooLarge { size, limit, .. } => FsError::TooLarge { size, limit },
            BackendError::Io { message } => FsError::Io { message },
            BackendError::Invalid { message } => FsError::Invalid { message },
            BackendError::PreconditionFailed { key, .. } => FsError::Busy {
                reason: format!("etag changed for {}", key),
            },
        }
    }
}
