//! Owner forwarding and invalidation fan-out.
//!
//! The coordinator wraps a local [`TideFs`] mount. Inode-scoped mutations
//! enter through [`Coordinator::submit`]: operations on locally-owned
//! inodes apply directly, everything else is forwarded to the owner over
//! the transport. The owner applies, answers, and broadcasts an
//! invalidation that peers use to drop cached state for the inode.
//!
//! [`LoopbackTransport`] wires several coordinators together in one
//! process, which is how the multi-node tests run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tracing::{debug, warn};

use tidefs_fs::{FileHandle, OpenFlags, SetAttr, TideFs};

use crate::error::{ClusterError, Result};
use crate::membership::{Membership, NodeId};
use crate::message::{Envelope, Invalidation, RemoteOp, Reply};
use crate::ownership::owner_of;

/// Delivery mechanism between cluster nodes.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Delivers an envelope to a node and waits for its reply.
    async fn send(&self, to: NodeId, envelope: Envelope) -> Result<Reply>;

    /// Fans an invalidation out to every node except the sender.
    async fn broadcast(&self, invalidation: Invalidation) -> Result<()>;
}

/// One node's view of the cluster.
pub struct Coordinator {
    membership: Arc<Membership>,
    transport: Arc<dyn ClusterTransport>,
    fs: Arc<TideFs>,
    seq: AtomicU64,
    /// Owner-side handles for forwarded writes, one per inode.
    write_handles: Mutex<HashMap<u64, FileHandle>>,
    applied: AtomicU64,
    invalidations_seen: Mutex<Vec<Invalidation>>,
}

impl Coordinator {
    /// Wraps a mount into a cluster node.
    pub fn new(
        membership: Arc<Membership>,
        transport: Arc<dyn ClusterTransport>,
        fs: Arc<TideFs>,
    ) -> Arc<Self> {
        Arc::new(Self {
            membership,
            transport,
            fs,
            seq: AtomicU64::new(0),
            write_handles: Mutex::new(HashMap::new()),
            applied: AtomicU64::new(0),
            invalidations_seen: Mutex::new(Vec::new()),
        })
    }

    /// The owner of an inode.
    pub fn owner(&self, ino: u64) -> NodeId {
        owner_of(ino, &self.membership)
    }

    /// Whether this node owns the inode.
    pub fn is_local(&self, ino: u64) -> bool {
        self.owner(ino) == self.membership.local()
    }

    /// The wrapped mount.
    pub fn fs(&self) -> &Arc<TideFs> {
        &self.fs
    }

    /// Operations applied on this node, local or forwarded here.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    /// Invalidations received from other nodes.
    pub fn invalidations_seen(&self) -> Vec<Invalidation> {
        self.invalidations_seen.lock().unwrap().clone()
    }

    /// Routes a mutation to its owner and returns the owner's reply.
    pub async fn submit(&self, op: RemoteOp) -> Result<Reply> {
        let ino = op.ino();
        let owner = self.owner(ino);

        if self.membership.is_lost(owner) {
            return Err(ClusterError::NodeLost { node: owner });
        }
        if owner == self.membership.local() {
            let reply = self.apply(op).await;
            if matches!(reply, Reply::Ok { .. }) {
                self.broadcast_invalidation(ino).await;
            }
            return Ok(reply);
        }

        let envelope = Envelope {
            from: self.membership.local(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            op,
        };
        debug!(
            "forwarding op for inode {} to owner {} (seq {})",
            ino, owner, envelope.seq
        );
        self.transport.send(owner, envelope).await
    }

    /// Entry point for envelopes arriving from peers (transport calls this
    /// on the owner).
    pub async fn handle_envelope(&self, envelope: Envelope) -> Reply {
        let ino = envelope.op.ino();
        if !self.is_local(ino) {
            // membership views diverged; refuse rather than double-apply
            return Reply::Err {
                errno: libc::EINVAL,
                message: format!("node {} does not own inode {}", self.membership.local(), ino),
            };
        }
        let reply = self.apply(envelope.op).await;
        if matches!(reply, Reply::Ok { .. }) {
            self.broadcast_invalidation(ino).await;
        }
        reply
    }

    /// Entry point for invalidations arriving from peers.
    pub fn handle_invalidation(&self, invalidation: Invalidation) {
        if invalidation.from == self.membership.local() {
            return;
        }
        self.fs.invalidate_inode(invalidation.ino);
        self.invalidations_seen.lock().unwrap().push(invalidation);
    }

    /// Marks a node lost and invalidates every inode it owned.
    pub fn node_lost(&self, node: NodeId) {
        self.membership.mark_lost(node);
        let mut dropped = 0;
        for ino in self.fs.inode_ids() {
            if self.owner(ino) == node {
                self.fs.invalidate_inode(ino);
                dropped += 1;
            }
        }
        warn!("node {} lost; invalidated {} owned inodes", node, dropped);
    }

    async fn broadcast_invalidation(&self, ino: u64) {
        let invalidation = Invalidation {
            ino,
            from: self.membership.local(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        };
        if let Err(e) = self.transport.broadcast(invalidation).await {
            warn!("invalidation broadcast for inode {} failed: {}", ino, e);
        }
    }

    async fn apply(&self, op: RemoteOp) -> Reply {
        self.applied.fetch_add(1, Ordering::SeqCst);
        let outcome = match op {
            RemoteOp::Write { ino, offset, data } => match self.write_handle(ino) {
                Ok(fh) => self
                    .fs
                    .write(fh, offset, &data)
                    .await
                    .map(|written| Reply::Ok {
                        written: Some(written),
                    }),
                Err(e) => Err(e),
            },
            RemoteOp::Truncate { ino, size } => self
                .fs
                .setattr(
                    ino,
                    SetAttr {
                        size: Some(size),
                        ..Default::default()
                    },
                )
                .await
                .map(|_| Reply::Ok { written: None }),
            RemoteOp::SetMode { ino, mode } => self
                .fs
                .setattr(
                    ino,
                    SetAttr {
                        mode: Some(mode),
                        ..Default::default()
                    },
                )
                .await
                .map(|_| Reply::Ok { written: None }),
            RemoteOp::Flush { ino } => match self.write_handle(ino) {
                Ok(fh) => self.fs.flush(fh).await.map(|_| Reply::Ok { written: None }),
                Err(e) => Err(e),
            },
        };
        match outcome {
            Ok(reply) => reply,
            Err(e) => Reply::Err {
                errno: e.to_errno(),
                message: e.to_string(),
            },
        }
    }

    /// The owner-side handle used to apply forwarded writes.
    fn write_handle(&self, ino: u64) -> tidefs_fs::Result<FileHandle> {
        let mut handles = self.write_handles.lock().unwrap();
        if let Some(fh) = handles.get(&ino) {
            return Ok(*fh);
        }
        let fh = self.fs.open(ino, OpenFlags::ReadWrite)?;
        handles.insert(ino, fh);
        Ok(fh)
    }
}

impl Reply {
    /// Turns a reply into a result, mapping owner failures to errors.
    pub fn into_result(self) -> Result<Option<u32>> {
        match self {
            Reply::Ok { written } => Ok(written),
            Reply::Err { errno, message } => Err(ClusterError::Remote { errno, message }),
        }
    }
}

/// In-process transport connecting coordinators directly.
#[derive(Default)]
pub struct LoopbackTransport {
    nodes: Mutex<HashMap<NodeId, Weak<Coordinator>>>,
}

impl LoopbackTransport {
    /// Empty transport; register each coordinator after construction.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a node's coordinator for delivery.
    pub fn register(&self, node: NodeId, coordinator: &Arc<Coordinator>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(node, Arc::downgrade(coordinator));
    }

    fn node(&self, id: NodeId) -> Option<Arc<Coordinator>> {
        self.nodes.lock().unwrap().get(&id).and_then(Weak::upgrade)
    }
}

#[async_trait]
impl ClusterTransport for LoopbackTransport {
    async fn send(&self, to: NodeId, envelope: Envelope) -> Result<Reply> {
        let target = self.node(to).ok_or(ClusterError::Transport {
            message: format!("node {} not registered", to),
        })?;
        Ok(target.handle_envelope(envelope).await)
    }

    async fn broadcast(&self, invalidation: Invalidation) -> Result<()> {
        let peers: Vec<Arc<Coordinator>> = {
            let nodes = self.nodes.lock().unwrap();
            nodes
                .iter()
                .filter(|(id, _)| **id != invalidation.from)
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        for peer in peers {
            peer.handle_invalidation(invalidation.clone());
        }
        Ok(())
    }
}
