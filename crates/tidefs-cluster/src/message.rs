//! Wire envelopes for owner forwarding and invalidation broadcast.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::membership::NodeId;

/// An inode-scoped mutation forwarded to the owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteOp {
    /// Write bytes at an offset.
    Write {
        /// Target inode.
        ino: u64,
        /// Byte offset.
        offset: u64,
        /// Payload.
        data: Vec<u8>,
    },
    /// Truncate or extend to a size.
    Truncate {
        /// Target inode.
        ino: u64,
        /// New size.
        size: u64,
    },
    /// Change permission bits.
    SetMode {
        /// Target inode.
        ino: u64,
        /// New mode.
        mode: u32,
    },
    /// Drain the inode's dirty set.
    Flush {
        /// Target inode.
        ino: u64,
    },
}

impl RemoteOp {
    /// The inode the operation is scoped to (the forwarding key).
    pub fn ino(&self) -> u64 {
        match self {
            RemoteOp::Write { ino, .. }
            | RemoteOp::Truncate { ino, .. }
            | RemoteOp::SetMode { ino, .. }
            | RemoteOp::Flush { ino } => *ino,
        }
    }
}

/// A forwarded operation with its origin and sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending node.
    pub from: NodeId,
    /// Per-sender sequence number.
    pub seq: u64,
    /// The operation.
    pub op: RemoteOp,
}

/// The owner's answer to a forwarded operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Reply {
    /// Operation applied.
    Ok {
        /// Bytes written, for write operations.
        written: Option<u32>,
    },
    /// Operation failed on the owner.
    Err {
        /// POSIX errno.
        errno: i32,
        /// Owner-side diagnostic.
        message: String,
    },
}

/// Broadcast after the owner applies a mutation; receivers drop cached
/// state for the inode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Invalidation {
    /// The mutated inode.
    pub ino: u64,
    /// The owner that applied the mutation.
    pub from: NodeId,
    /// Owner-side sequence number.
    pub seq: u64,
}

/// Encodes an envelope for the wire.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decodes an envelope off the wire.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope> {
    Ok(serde_json::from_slice(bytes)?)
}
