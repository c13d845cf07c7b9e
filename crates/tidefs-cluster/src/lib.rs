#![warn(missing_docs)]

//! TideFS cluster coordinator.
//!
//! When several processes mount the same bucket cooperatively, every inode
//! has one deterministic owner node; mutations are forwarded to the owner
//! over a pluggable transport and applied there, giving single-writer
//! semantics per inode without a distributed lock. The owner broadcasts a
//! short invalidation after each applied mutation so peers drop their
//! cached state. Membership is static for the lifetime of a run; a lost
//! node invalidates every inode it owned and requires a remount.

pub mod coordinator;
pub mod error;
pub mod membership;
pub mod message;
pub mod ownership;

pub use coordinator::{ClusterTransport, Coordinator, LoopbackTransport};
pub use error::{ClusterError, Result};
pub use membership::{Membership, NodeId};
pub use message::{Envelope, Invalidation, RemoteOp, Reply};
pub use ownership::owner_of;
