//! Deterministic inode ownership.
//!
//! Every node computes the same owner for an inode from the shared member
//! list: an FNV-1a hash of the inode id modulo the membership size. The
//! hash is spelled out here rather than taken from `DefaultHasher`, whose
//! output is free to differ between processes.

use crate::membership::{Membership, NodeId};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the inode id's little-endian bytes.
fn hash_ino(ino: u64) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in ino.to_le_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// The node that owns an inode under this membership.
pub fn owner_of(ino: u64, membership: &Membership) -> NodeId {
    let nodes = membership.nodes();
    let index = (hash_ino(ino) % nodes.len() as u64) as usize;
    nodes[index]
}
