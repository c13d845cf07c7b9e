//! Static cluster membership.
//!
//! The member list is fixed for the lifetime of a run. Nodes can only be
//! marked lost; recovery is a remount with a fresh list.

use std::collections::HashSet;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Identifier of one cluster node.
pub type NodeId = u32;

/// Fixed member list plus the lost set.
#[derive(Debug)]
pub struct Membership {
    local: NodeId,
    nodes: Vec<NodeId>,
    lost: RwLock<HashSet<NodeId>>,
}

/// Serialisable snapshot of a membership, for config exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// This node's id.
    pub local: NodeId,
    /// All member ids, identically ordered on every node.
    pub nodes: Vec<NodeId>,
}

impl Membership {
    /// Builds a membership. The node list must be identically ordered on
    /// every member, so it is sorted and deduplicated here.
    pub fn new(local: NodeId, mut nodes: Vec<NodeId>) -> Self {
        nodes.sort_unstable();
        nodes.dedup();
        if !nodes.contains(&local) {
            nodes.push(local);
            nodes.sort_unstable();
        }
        Self {
            local,
            nodes,
            lost: RwLock::new(HashSet::new()),
        }
    }

    /// Builds from a config snapshot.
    pub fn from_config(config: MembershipConfig) -> Self {
        Self::new(config.local, config.nodes)
    }

    /// This node's id.
    pub fn local(&self) -> NodeId {
        self.local
    }

    /// Member ids in canonical order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Number of members (lost nodes still count; ownership never moves).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the membership holds no nodes (never true after `new`).
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `node` belongs to the membership.
    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }

    /// Marks a node lost. Ownership does not move; the caller invalidates
    /// the lost node's inodes and the operator remounts.
    pub fn mark_lost(&self, node: NodeId) {
        if self.contains(node) {
            warn!("node {} marked lost; its inodes need a remount", node);
            self.lost.write().unwrap().insert(node);
        }
    }

    /// Whether a node has been marked lost.
    pub fn is_lost(&self, node: NodeId) -> bool {
        self.lost.read().unwrap().contains(&node)
    }
}
