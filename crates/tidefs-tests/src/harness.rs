//! Test environment setup: single mounts and loopback clusters.

use std::path::PathBuf;
use std::sync::Arc;

use tidefs_backend::{Capabilities, DynBackend, MemoryBackend};
use tidefs_cluster::{ClusterTransport, Coordinator, LoopbackTransport, Membership, NodeId};
use tidefs_fs::{FileHandle, InodeId, MountConfig, OpenFlags, TideFs, ROOT_INODE};

/// Backend capabilities shrunk so multipart paths trigger on tiny bodies.
pub fn small_caps() -> Capabilities {
    let mut caps = Capabilities::s3_defaults("memory");
    caps.min_part_size = 8;
    caps.max_part_size = 64;
    caps
}

/// One mounted filesystem over a private in-memory backend.
pub struct TestMount {
    /// The backend, for seeding and assertions.
    pub backend: Arc<MemoryBackend>,
    /// The mounted filesystem.
    pub fs: TideFs,
}

impl TestMount {
    /// Mounts with the default shrunk test configuration.
    pub async fn new() -> Self {
        Self::with_config(MountConfig::small_for_tests()).await
    }

    /// Mounts with an explicit configuration.
    pub async fn with_config(config: MountConfig) -> Self {
        let backend = Arc::new(MemoryBackend::with_capabilities(small_caps()));
        let fs = TideFs::mount(config, backend.clone() as DynBackend)
            .await
            .expect("mount");
        Self { backend, fs }
    }

    /// Mounts with a spill directory under `dir`.
    pub async fn with_spill(dir: PathBuf, memory_budget: u64) -> Self {
        let config = MountConfig {
            memory_budget,
            spill_dir: Some(dir),
            ..MountConfig::small_for_tests()
        };
        Self::with_config(config).await
    }

    /// Creates a file, writes `data` at offset 0 and closes it.
    pub async fn put_file(&self, parent: InodeId, name: &str, data: &[u8]) -> InodeId {
        let (attr, fh) = self.fs.create(parent, name, 0o644).await.expect("create");
        self.fs.write(fh, 0, data).await.expect("write");
        self.fs.release(fh).await.expect("release");
        attr.ino
    }

    /// Opens, reads the whole file, closes.
    pub async fn read_file(&self, ino: InodeId) -> Vec<u8> {
        let size = self.fs.getattr(ino).expect("getattr").size;
        let fh = self.fs.open(ino, OpenFlags::ReadOnly).expect("open");
        let data = self.fs.read(fh, 0, size as u32).await.expect("read");
        self.fs.release(fh).await.expect("release");
        data
    }

    /// Opens a read-write handle.
    pub fn open_rw(&self, ino: InodeId) -> FileHandle {
        self.fs.open(ino, OpenFlags::ReadWrite).expect("open")
    }

    /// Names visible in a directory.
    pub async fn names_in(&self, ino: InodeId) -> Vec<String> {
        self.fs
            .readdir(ino)
            .await
            .expect("readdir")
            .into_iter()
            .map(|e| e.name)
            .collect()
    }
}

/// A loopback cluster of coordinators over one shared backend.
pub struct TestCluster {
    /// The shared backend.
    pub backend: Arc<MemoryBackend>,
    /// One coordinator per node, in id order.
    pub nodes: Vec<Arc<Coordinator>>,
}

impl TestCluster {
    /// Builds an `n`-node cluster mounted on the same bucket.
    pub async fn new(n: u32) -> Self {
        let backend = Arc::new(MemoryBackend::with_capabilities(small_caps()));
        let transport = LoopbackTransport::new();
        let ids: Vec<NodeId> = (1..=n).collect();

        let mut nodes = Vec::new();
        for id in &ids {
            let fs = Arc::new(
                TideFs::mount(
                    MountConfig::small_for_tests(),
                    backend.clone() as DynBackend,
                )
                .await
                .expect("mount"),
            );
            let membership = Arc::new(Membership::new(*id, ids.clone()));
            let coordinator = Coordinator::new(
                membership,
                transport.clone() as Arc<dyn ClusterTransport>,
                fs,
            );
            transport.register(*id, &coordinator);
            nodes.push(coordinator);
        }
        Self { backend, nodes }
    }

    /// Seeds an object and resolves it on every node, asserting the nodes
    /// agree on the inode id.
    pub async fn shared_file(&self, name: &str, data: &[u8]) -> InodeId {
        self.backend.seed_object(
            name,
            data.to_vec(),
            tidefs_backend::types::BlobMetadata::new(),
        );
        let mut ino = None;
        for node in &self.nodes {
            let attr = node.fs().lookup(ROOT_INODE, name).await.expect("lookup");
            match ino {
                None => ino = Some(attr.ino),
                Some(existing) => assert_eq!(existing, attr.ino, "inode ids diverged"),
            }
        }
        ino.expect("at least one node")
    }

    /// The coordinator owning an inode.
    pub fn owner_node(&self, ino: InodeId) -> &Arc<Coordinator> {
        self.nodes
            .iter()
            .find(|n| n.is_local(ino))
            .expect("owner registered")
    }

    /// Any coordinator that does not own the inode.
    pub fn non_owner_node(&self, ino: InodeId) -> &Arc<Coordinator> {
        self.nodes
            .iter()
            .find(|n| !n.is_local(ino))
            .expect("cluster has more than one node")
    }
}
