//! Cluster error type.

use thiserror::Error;

/// Errors raised by the coordinator layer.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The target node is not in the membership list.
    #[error("node {node} is not a member")]
    NotMember {
        /// Offending node id.
        node: u32,
    },

    /// The target node is known lost; its inodes need a remount.
    #[error("node {node} was lost; remount required")]
    NodeLost {
        /// The lost node.
        node: u32,
    },

    /// The transport failed to deliver.
    #[error("transport failure: {message}")]
    Transport {
        /// Diagnostic from the transport.
        message: String,
    },

    /// The remote node applied the operation and reported a failure.
    #[error("remote errno {errno}: {message}")]
    Remote {
        /// POSIX errno from the owner.
        errno: i32,
        /// Owner-side diagnostic.
        message: String,
    },

    /// Envelope could not be encoded or decoded.
    #[error("codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Result alias for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

impl ClusterError {
    /// POSIX errno for the kernel boundary.
    pub fn to_errno(&self) -> i32 {
        match self {
            ClusterError::NotMember { .. } => libc::EINVAL,
            ClusterError::NodeLost { .. } => libc::EIO,
            ClusterError::Transport { .. } => libc::EIO,
            ClusterError::Remote { errno, .. } => *errno,
            ClusterError::Codec(_) => libc::EIO,
        }
    }
}
