//! The filesystem facade.
//!
//! [`TideFs`] owns every subsystem of one mount and exposes the typed
//! operation set the FUSE adapter calls: lookup, attributes, create, unlink,
//! open, read, write, release, flush, readdir, rename, symlink, and unmount.
//! Backend I/O is always awaited outside the inode locks: each operation
//! snapshots what it needs under a lock, performs the remote calls, then
//! reacquires to install results.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tidefs_backend::types::*;
use tidefs_backend::{
    keys, metadata as meta_keys, new_cancel_pair, BackendError, CancelHandle, CancelReason,
    CancelToken, Capabilities, DirMarkerScheme, DynBackend, RetryExecutor, ThrottleGates,
};

use crate::attr::{attrs_from_metadata, default_mode, FileAttr};
use crate::config::MountConfig;
use crate::dir_cache::{merge_page, ListingState};
use crate::error::{FsError, Result};
use crate::flusher::Flusher;
use crate::handle::{FileHandle, HandleTable, OpenFlags};
use crate::inode::{Inode, InodeId, InodeKind, InodeState, InodeTable, ROOT_INODE};
use crate::pool::BufferPool;
use crate::prefetch::{PrefetchConfig, Prefetcher};
use crate::rename::RenameEngine;
use crate::spill::SpillStore;

/// One entry returned by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Child name.
    pub name: String,
    /// Child inode id.
    pub ino: InodeId,
    /// Child kind.
    pub kind: InodeKind,
}

/// Attribute changes requested by `setattr`; unset fields stay unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    /// New permission bits.
    pub mode: Option<u32>,
    /// New owner uid.
    pub uid: Option<u32>,
    /// New owner gid.
    pub gid: Option<u32>,
    /// New size (truncate or extend).
    pub size: Option<u64>,
    /// New modification time.
    pub mtime: Option<SystemTime>,
    /// New access time.
    pub atime: Option<SystemTime>,
}

struct FsShared {
    config: MountConfig,
    backend: DynBackend,
    caps: Capabilities,
    gates: ThrottleGates,
    retry: RetryExecutor,
    table: InodeTable,
    pool: Arc<BufferPool>,
    prefetcher: Prefetcher,
    flusher: Flusher,
    rename: RenameEngine,
    handles: Mutex<HandleTable>,
    spill: Option<SpillStore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancelToken,
    cancel_handle: CancelHandle,
}

impl FsShared {
    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(FsError::Busy {
                reason: format!(
                    "operation cancelled: {}",
                    self.cancel.reason().unwrap_or_default()
                ),
            });
        }
        Ok(())
    }
}

/// A mounted bucket.
pub struct TideFs {
    shared: Arc<FsShared>,
}

impl TideFs {
    /// Mounts a backend: builds the subsystems, reaps stale spill files and
    /// aborts multipart uploads left behind by a crashed run.
    pub async fn mount(config: MountConfig, backend: DynBackend) -> Result<Self> {
        let caps = backend.capabilities();
        let gates = ThrottleGates::new(config.throttle.clone());
        let retry = RetryExecutor::new(config.retry.clone());
        let pool = Arc::new(BufferPool::new(
            config.memory_budget,
            config.high_watermark_bytes(),
            config.low_watermark_bytes(),
        ));
        let spill = match &config.spill_dir {
            Some(dir) => {
                let store = SpillStore::new(dir.clone())?;
                store.scan_and_reap();
                Some(store)
            }
            None => None,
        };
        let flusher = Flusher::new(
            Arc::clone(&backend),
            caps.clone(),
            gates.clone(),
            retry.clone(),
            Arc::clone(&pool),
            config.clone(),
        );
        let rename = RenameEngine::new(
            Arc::clone(&backend),
            caps.clone(),
            retry.clone(),
            gates.clone(),
            config.rename_policy,
            config.instant_rename,
        );

        if let Err(e) = flusher.sweep_stale_uploads().await {
            warn!("stale upload sweep failed: {}", e);
        }

        let prefetcher = Prefetcher::new(PrefetchConfig {
            initial_window: config.readahead_initial,
            max_window: config.readahead_max,
        });

        let (cancel, cancel_handle) = new_cancel_pair();
        info!("mounted backend {} (caps: {:?})", caps.name, caps.dir_markers);
        Ok(Self {
            shared: Arc::new(FsShared {
                table: InodeTable::new(0, 0),
                prefetcher,
                flusher,
                rename,
                handles: Mutex::new(HandleTable::new()),
                spill,
                tasks: Mutex::new(Vec::new()),
                cancel,
                cancel_handle,
                pool,
                gates,
                retry,
                caps,
                backend,
                config,
            }),
        })
    }

    /// Waits for every background task (flushes, readahead) to finish.
    pub async fn quiesce(&self) {
        loop {
            let task = self.shared.tasks.lock().unwrap().pop();
            match task {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => return,
            }
        }
    }

    /// Pool counters, for tests and diagnostics.
    pub fn pool_stats(&self) -> crate::pool::PoolStats {
        self.shared.pool.stats()
    }

    /// Ids of every live inode.
    pub fn inode_ids(&self) -> Vec<InodeId> {
        self.shared.table.all_ids()
    }

    /// Drops an inode's cached state: clean pages are discarded, the etag
    /// forgotten, and a directory's listing marked stale. Dirty local data
    /// is kept. Used by the cluster coordinator on invalidation messages.
    pub fn invalidate_inode(&self, ino: InodeId) {
        let inode = match self.shared.table.get(ino) {
            Some(i) => i,
            None => return,
        };
        match inode.kind {
            InodeKind::File => {
                inode.meta.write().unwrap().etag = None;
                let freed = inode.file.lock().unwrap().buffers.invalidate_clean();
                if freed > 0 {
                    self.shared.pool.apply_delta(-(freed as i64), 0);
                }
                self.shared.pool.forget_inode(ino);
            }
            InodeKind::Directory => {
                inode.dir.write().unwrap().listing.invalidate();
                inode.dir.write().unwrap().negative.clear();
            }
            InodeKind::Symlink => {}
        }
        debug!("invalidated inode {}", ino);
    }

    // ---- namespace operations ----

    /// Resolves `name` under `parent`, discovering remote objects on miss.
    pub async fn lookup(&self, parent: InodeId, name: &str) -> Result<FileAttr> {
        let inode = self.lookup_inode(parent, name).await?;
        inode.meta.write().unwrap().lookup_count += 1;
        Ok(inode.attr())
    }

    /// Attributes of an inode.
    pub fn getattr(&self, ino: InodeId) -> Result<FileAttr> {
        Ok(self.shared.table.require(ino)?.attr())
    }

    /// Applies attribute changes; size changes edit the buffer extent.
    pub async fn setattr(&self, ino: InodeId, changes: SetAttr) -> Result<FileAttr> {
        let inode = self.shared.table.require(ino)?;

        if let Some(new_size) = changes.size {
            if inode.kind != InodeKind::File {
                return Err(FsError::IsDirectory { ino });
            }
            let (res_delta, acc_delta) = {
                let mut meta = inode.meta.write().unwrap();
                let mut file = inode.file.lock().unwrap();
                let old_res = file.buffers.resident_bytes();
                let old_acc = file.buffers.accountable_bytes();
                file.buffers.truncate(meta.size, new_size);
                meta.size = new_size;
                if meta.state == InodeState::Clean {
                    meta.state = InodeState::Modified;
                }
                meta.mtime = SystemTime::now();
                (
                    file.buffers.resident_bytes() as i64 - old_res as i64,
                    file.buffers.accountable_bytes() as i64 - old_acc as i64,
                )
            };
            self.shared.pool.apply_delta(res_delta, acc_delta);
        }

        {
            let mut meta = inode.meta.write().unwrap();
            if let Some(mode) = changes.mode {
                meta.mode = mode & 0o7777;
            }
            if let Some(uid) = changes.uid {
                meta.uid = uid;
            }
            if let Some(gid) = changes.gid {
                meta.gid = gid;
            }
            if let Some(mtime) = changes.mtime {
                meta.mtime = mtime;
            }
            if let Some(atime) = changes.atime {
                meta.atime = atime;
            }
            let attr_change = changes.mode.is_some()
                || changes.uid.is_some()
                || changes.gid.is_some()
                || changes.mtime.is_some();
            if attr_change && meta.state == InodeState::Clean {
                meta.state = InodeState::Modified;
            }
            meta.ctime = SystemTime::now();
        }
        Ok(inode.attr())
    }

    /// Creates a file and opens a read-write handle on it.
    pub async fn create(
        &self,
        parent: InodeId,
        name: &str,
        mode: u32,
    ) -> Result<(FileAttr, FileHandle)> {
        let parent_inode = self.require_dir(parent)?;
        if self.lookup_inode(parent, name).await.is_ok() {
            return Err(FsError::Exists {
                name: name.to_string(),
            });
        }
        let inode = self.shared.table.alloc(
            &parent_inode,
            name,
            InodeKind::File,
            mode & 0o7777,
            0,
            0,
            InodeState::NewFile,
        )?;
        let fh = {
            let mut meta = inode.meta.write().unwrap();
            meta.open_count += 1;
            self.shared
                .handles
                .lock()
                .unwrap()
                .open(inode.id, OpenFlags::ReadWrite)
        };
        debug!("create {}/{} -> ino {}", parent, name, inode.id);
        Ok((inode.attr(), fh))
    }

    /// Creates a directory, materialising a marker blob when the backend
    /// needs one to represent an empty prefix.
    pub async fn mkdir(&self, parent: InodeId, name: &str, mode: u32) -> Result<FileAttr> {
        let parent_inode = self.require_dir(parent)?;
        if self.lookup_inode(parent, name).await.is_ok() {
            return Err(FsError::Exists {
                name: name.to_string(),
            });
        }
        let inode = self.shared.table.alloc(
            &parent_inode,
            name,
            InodeKind::Directory,
            mode & 0o7777,
            0,
            0,
            InodeState::Clean,
        )?;

        if self.shared.caps.dir_markers == DirMarkerScheme::TrailingSlash {
            let key = keys::dir_marker_key(&self.shared.table.key_of(inode.id)?);
            let metadata = if self.shared.config.store_attrs {
                meta_keys::attr_metadata(mode & 0o7777, 0, 0, SystemTime::now())
            } else {
                BlobMetadata::new()
            };
            let _permit = self.shared.gates.acquire_small().await;
            let put = self
                .shared
                .retry
                .execute(|| {
                    self.shared.backend.put_blob(PutBlobInput {
                        key: key.clone(),
                        data: Vec::new(),
                        metadata: metadata.clone(),
                        content_type: None,
                        storage_class: None,
                    })
                })
                .await
                .into_result();
            if let Err(e) = put {
                self.shared.table.detach_child(&parent_inode, name)?;
                inode.meta.write().unwrap().state = InodeState::Deleted;
                self.shared.table.try_reclaim(&inode);
                return Err(e.into());
            }
        }
        Ok(inode.attr())
    }

    /// Unlinks a file or symlink.
    pub async fn unlink(&self, parent: InodeId, name: &str) -> Result<()> {
        let parent_inode = self.require_dir(parent)?;
        let inode = self.lookup_inode(parent, name).await?;
        if inode.kind == InodeKind::Directory {
            return Err(FsError::IsDirectory { ino: inode.id });
        }

        let key = self.shared.table.key_of(inode.id)?;
        let had_remote = {
            let meta = inode.meta.read().unwrap();
            meta.etag.is_some() || meta.state == InodeState::Clean
        };

        self.shared.table.detach_child(&parent_inode, name)?;
        let freed = {
            let mut meta = inode.meta.write().unwrap();
            meta.state = InodeState::Deleted;
            meta.nlink = 0;
            let mut file = inode.file.lock().unwrap();
            file.sticky_error = None;
            let acc = file.buffers.accountable_bytes();
            let res = file.buffers.clear();
            (res as i64, acc as i64)
        };
        self.shared.pool.apply_delta(-freed.0, -freed.1);
        self.shared.pool.forget_inode(inode.id);

        if had_remote {
            let _permit = self.shared.gates.acquire_small().await;
            let outcome = self
                .shared
                .retry
                .execute(|| self.shared.backend.delete_blob(&key))
                .await
                .into_result();
            match outcome {
                Ok(()) | Err(BackendError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.shared.table.try_reclaim(&inode);
        debug!("unlinked {}/{} (key {})", parent, name, key);
        Ok(())
    }

    /// Removes an empty directory.
    pub async fn rmdir(&self, parent: InodeId, name: &str) -> Result<()> {
        let parent_inode = self.require_dir(parent)?;
        let inode = self.lookup_inode(parent, name).await?;
        if inode.kind != InodeKind::Directory {
            return Err(FsError::NotDirectory { ino: inode.id });
        }

        self.ensure_listed(&inode).await?;
        if !inode.dir.read().unwrap().children.is_empty() {
            return Err(FsError::NotEmpty { ino: inode.id });
        }

        let marker = keys::dir_marker_key(&self.shared.table.key_of(inode.id)?);
        self.shared.table.detach_child(&parent_inode, name)?;
        inode.meta.write().unwrap().state = InodeState::Deleted;

        if self.shared.caps.dir_markers == DirMarkerScheme::TrailingSlash {
            let _permit = self.shared.gates.acquire_small().await;
            let outcome = self
                .shared
                .retry
                .execute(|| self.shared.backend.delete_blob(&marker))
                .await
                .into_result();
            match outcome {
                Ok(()) | Err(BackendError::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.shared.table.try_reclaim(&inode);
        Ok(())
    }

    /// Creates a symlink. The target travels as object metadata.
    pub async fn symlink(&self, parent: InodeId, name: &str, target: &str) -> Result<FileAttr> {
        let parent_inode = self.require_dir(parent)?;
        if self.lookup_inode(parent, name).await.is_ok() {
            return Err(FsError::Exists {
                name: name.to_string(),
            });
        }
        let inode = self.shared.table.alloc(
            &parent_inode,
            name,
            InodeKind::Symlink,
            default_mode(InodeKind::Symlink),
            0,
            0,
            InodeState::NewFile,
        )?;
        {
            let mut meta = inode.meta.write().unwrap();
            meta.symlink_target = Some(target.to_string());
            meta.size = target.len() as u64;
        }

        let key = self.shared.table.key_of(inode.id)?;
        let mut metadata = if self.shared.config.store_attrs {
            meta_keys::attr_metadata(default_mode(InodeKind::Symlink), 0, 0, SystemTime::now())
        } else {
            BlobMetadata::new()
        };
        metadata.insert(meta_keys::META_SYMLINK.to_string(), target.to_string());

        let _permit = self.shared.gates.acquire_small().await;
        let put = self
            .shared
            .retry
            .execute(|| {
                self.shared.backend.put_blob(PutBlobInput {
                    key: key.clone(),
                    data: Vec::new(),
                    metadata: metadata.clone(),
                    content_type: None,
                    storage_class: None,
                })
            })
            .await
            .into_result();
        match put {
            Ok(out) => {
                let mut meta = inode.meta.write().unwrap();
                meta.etag = Some(out.etag);
                meta.state = InodeState::Clean;
            }
            Err(e) => {
                self.shared.table.detach_child(&parent_inode, name)?;
                inode.meta.write().unwrap().state = InodeState::Deleted;
                self.shared.table.try_reclaim(&inode);
                return Err(e.into());
            }
        }
        Ok(inode.attr())
    }

    /// Reads a symlink's target.
    pub async fn readlink(&self, ino: InodeId) -> Result<String> {
        let inode = self.shared.table.require(ino)?;
        if inode.kind != InodeKind::Symlink {
            return Err(FsError::invalid(format!("inode {} is not a symlink", ino)));
        }
        if let Some(target) = inode.meta.read().unwrap().symlink_target.clone() {
            return Ok(target);
        }
        // target was never cached; it lives in the object metadata
        let key = self.shared.table.key_of(ino)?;
        let _permit = self.shared.gates.acquire_small().await;
        let head = self
            .shared
            .retry
            .execute(|| {
                self.shared.backend.head_blob(HeadBlobInput { key: key.clone() })
            })
            .await
            .into_result()?;
        let target = head
            .metadata
            .get(meta_keys::META_SYMLINK)
            .cloned()
            .ok_or_else(|| FsError::invalid(format!("{} has no symlink target", key)))?;
        inode.meta.write().unwrap().symlink_target = Some(target.clone());
        Ok(target)
    }

    /// Drops kernel lookup references.
    pub fn forget(&self, ino: InodeId, nlookup: u64) {
        self.shared.prefetcher.forget(ino);
        self.shared.table.forget(ino, nlookup);
    }

    // ---- file I/O ----

    /// Opens a file, returning a handle.
    pub fn open(&self, ino: InodeId, flags: OpenFlags) -> Result<FileHandle> {
        let inode = self.shared.table.require(ino)?;
        if inode.kind == InodeKind::Directory {
            return Err(FsError::IsDirectory { ino });
        }
        let mut meta = inode.meta.write().unwrap();
        if meta.open_count == 0 {
            // a fresh open resets any stuck flush error
            inode.file.lock().unwrap().sticky_error = None;
        }
        meta.open_count += 1;
        Ok(self.shared.handles.lock().unwrap().open(ino, flags))
    }

    /// Reads through a handle. Short reads happen only at end of file.
    pub async fn read(&self, fh: FileHandle, offset: u64, len: u32) -> Result<Vec<u8>> {
        let entry = self.handle_entry(fh)?;
        if !entry.flags.is_readable() {
            return Err(FsError::Permission { op: "read" });
        }
        let inode = self.shared.table.require(entry.ino)?;
        self.shared.check_cancelled()?;
        self.check_sticky(&inode)?;

        let size = inode.meta.read().unwrap().size;
        self.populate_range(&inode, offset, len as u64).await?;

        let bytes = {
            let file = inode.file.lock().unwrap();
            let segments = file.buffers.read(offset, len as u64, size)?;
            let mut out = Vec::with_capacity(len as usize);
            for segment in segments {
                match segment {
                    crate::buffer::ReadSegment::Data { bytes, .. } => out.extend_from_slice(&bytes),
                    crate::buffer::ReadSegment::Zero { len, .. } => {
                        out.extend(std::iter::repeat(0u8).take(len as usize))
                    }
                    crate::buffer::ReadSegment::Missing { offset, len } => {
                        return Err(FsError::Io {
                            message: format!("range [{}, {}) vanished mid-read", offset, offset + len),
                        })
                    }
                }
            }
            for (off, plen) in file.buffers.clean_resident() {
                if off < offset + len as u64 && off + plen > offset {
                    self.shared.pool.touch_clean(inode.id, off, plen);
                }
            }
            out
        };
        inode.meta.write().unwrap().atime = SystemTime::now();

        // readahead: schedule the adaptive window behind the cursor
        if let Some(window) = self
            .shared
            .prefetcher
            .record_read(inode.id, offset, len as u64, size)
        {
            self.spawn_prefetch(&inode, window.offset, window.len);
        }
        Ok(bytes)
    }

    /// Writes through a handle, growing the file as needed.
    pub async fn write(&self, fh: FileHandle, offset: u64, data: &[u8]) -> Result<u32> {
        let entry = self.handle_entry(fh)?;
        if !entry.flags.is_writable() {
            return Err(FsError::Permission { op: "write" });
        }
        let inode = self.shared.table.require(entry.ino)?;
        if inode.kind != InodeKind::File {
            return Err(FsError::invalid("write on non-file"));
        }
        self.shared.check_cancelled()?;
        self.check_sticky(&inode)?;

        // back-pressure: block while the dirty set is above the watermark
        self.shared.pool.reserve_write().await;

        let max_buffer = self
            .shared
            .caps
            .clamp_part_size(self.shared.config.part_size);
        let (res_delta, acc_delta, dirty_total) = {
            let mut meta = inode.meta.write().unwrap();
            let mut file = inode.file.lock().unwrap();
            let old_res = file.buffers.resident_bytes();
            let old_acc = file.buffers.accountable_bytes();

            if offset > meta.size {
                // writing past the end materialises the gap as a hole
                file.buffers.zero_fill(meta.size, offset);
            }
            file.buffers.write(offset, data, max_buffer);

            meta.size = meta.size.max(offset + data.len() as u64);
            meta.mtime = SystemTime::now();
            if meta.state == InodeState::Clean {
                meta.state = InodeState::Modified;
            }
            (
                file.buffers.resident_bytes() as i64 - old_res as i64,
                file.buffers.accountable_bytes() as i64 - old_acc as i64,
                file.buffers.dirty_bytes(),
            )
        };
        self.shared.pool.apply_delta(res_delta, acc_delta);

        if dirty_total >= self.shared.config.multipart_threshold {
            self.spawn_flush(&inode);
        }
        self.enforce_budget(&inode);
        Ok(data.len() as u32)
    }

    /// Blocks until the inode's dirty set is clean.
    pub async fn flush(&self, fh: FileHandle) -> Result<()> {
        let entry = self.handle_entry(fh)?;
        let inode = self.shared.table.require(entry.ino)?;
        self.shared
            .flusher
            .flush_inode(&self.shared.table, &inode)
            .await
    }

    /// `fsync` behaves exactly like `flush`: close-to-open plus explicit sync.
    pub async fn fsync(&self, fh: FileHandle) -> Result<()> {
        self.flush(fh).await
    }

    /// Closes a handle. The last handle drains the dirty set first, so a
    /// subsequent open observes everything written before this close.
    pub async fn release(&self, fh: FileHandle) -> Result<()> {
        let entry = self
            .shared
            .handles
            .lock()
            .unwrap()
            .close(fh)
            .ok_or(FsError::BadHandle { fh })?;
        let inode = self.shared.table.require(entry.ino)?;

        let flush_result = if inode.kind == InodeKind::File {
            self.shared
                .flusher
                .flush_inode(&self.shared.table, &inode)
                .await
        } else {
            Ok(())
        };

        {
            let mut meta = inode.meta.write().unwrap();
            meta.open_count = meta.open_count.saturating_sub(1);
        }
        if inode.meta.read().unwrap().open_count == 0 {
            self.shared.prefetcher.forget(inode.id);
        }
        self.shared.table.try_reclaim(&inode);
        flush_result
    }

    // ---- directories ----

    /// Lists a directory, refreshing the backend listing when stale.
    pub async fn readdir(&self, ino: InodeId) -> Result<Vec<DirEntry>> {
        let inode = self.require_dir(ino)?;
        self.ensure_listed(&inode).await?;

        let mut entries: Vec<DirEntry> = {
            let dir = inode.dir.read().unwrap();
            dir.children
                .iter()
                .filter_map(|(name, id)| {
                    self.shared.table.get(*id).map(|child| DirEntry {
                        name: name.clone(),
                        ino: *id,
                        kind: child.kind,
                    })
                })
                .collect()
        };
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        inode.meta.write().unwrap().atime = SystemTime::now();
        Ok(entries)
    }

    /// Renames a file or directory.
    ///
    /// The inode graph moves first, so the kernel observes the new name
    /// immediately; a backend failure rolls the graph back and surfaces the
    /// error, with no source key deleted.
    pub async fn rename(
        &self,
        src_parent: InodeId,
        src_name: &str,
        dst_parent: InodeId,
        dst_name: &str,
    ) -> Result<()> {
        if !keys::valid_name(dst_name) {
            return Err(FsError::invalid(format!("bad name {:?}", dst_name)));
        }
        let src_dir = self.require_dir(src_parent)?;
        let dst_dir = self.require_dir(dst_parent)?;
        let inode = self.lookup_inode(src_parent, src_name).await?;

        // a displaced destination leaves the namespace before the move
        let displaced = match self.lookup_inode(dst_parent, dst_name).await {
            Ok(existing) => {
                if existing.kind == InodeKind::Directory {
                    self.ensure_listed(&existing).await?;
                    if !existing.dir.read().unwrap().children.is_empty() {
                        return Err(FsError::NotEmpty { ino: existing.id });
                    }
                }
                self.shared.table.detach_child(&dst_dir, dst_name)?;
                existing.meta.write().unwrap().state = InodeState::Deleted;
                Some(existing)
            }
            Err(_) => None,
        };

        // dirty source data must exist remotely before keys can be copied
        for file in self.subtree_files(&inode) {
            self.shared.flusher.flush_inode(&self.shared.table, &file).await?;
        }

        let src_key = self.shared.table.key_of(inode.id)?;

        self.shared.table.detach_child(&src_dir, src_name)?;
        if let Err(e) = self.shared.table.attach_child(&dst_dir, dst_name, &inode) {
            // restore before reporting
            let _ = self.shared.table.attach_child(&src_dir, src_name, &inode);
            if let Some(d) = displaced {
                d.meta.write().unwrap().state = InodeState::Clean;
                let _ = self.shared.table.attach_child(&dst_dir, dst_name, &d);
            }
            return Err(e);
        }
        let dst_key = self.shared.table.key_of(inode.id)?;
        inode.meta.write().unwrap().state = InodeState::Renamed(dst_key.clone());

        let backend_result = self.rename_backend(&inode, &src_key, &dst_key).await;

        match backend_result {
            Ok(()) => {
                {
                    let mut meta = inode.meta.write().unwrap();
                    meta.state = InodeState::Clean;
                    meta.ctime = SystemTime::now();
                }
                if let Some(d) = displaced {
                    self.shared.table.try_reclaim(&d);
                }
                debug!("renamed {} -> {}", src_key, dst_key);
                Ok(())
            }
            Err(e) => {
                warn!("backend rename {} -> {} failed: {}", src_key, dst_key, e);
                let _ = self.shared.table.detach_child(&dst_dir, dst_name);
                let _ = self.shared.table.attach_child(&src_dir, src_name, &inode);
                inode.meta.write().unwrap().state = InodeState::Clean;
                if let Some(d) = displaced {
                    d.meta.write().unwrap().state = InodeState::Clean;
                    let _ = self.shared.table.attach_child(&dst_dir, dst_name, &d);
                }
                Err(e)
            }
        }
    }

    async fn rename_backend(
        &self,
        inode: &Arc<Inode>,
        src_key: &str,
        dst_key: &str,
    ) -> Result<()> {
        match inode.kind {
            InodeKind::File | InodeKind::Symlink => {
                self.shared.rename.rename_key(src_key, dst_key).await
            }
            InodeKind::Directory => {
                // every backend key under the prefix moves, including keys
                // for objects never materialised locally
                let mut pairs: Vec<(String, String)> = Vec::new();
                let prefix = keys::children_prefix(src_key);
                let mut continuation: Option<String> = None;
                loop {
                    let _permit = self.shared.gates.acquire_small().await;
                    let page = self
                        .shared
                        .retry
                        .execute(|| {
                            self.shared.backend.list_blobs(ListBlobsInput {
                                prefix: Some(prefix.clone()),
                                delimiter: None,
                                continuation: continuation.clone(),
                                max_keys: self.shared.caps.max_list_page,
                            })
                        })
                        .await
                        .into_result()?;
                    for item in &page.items {
                        if let Some(rebased) = keys::rebase_key(&item.key, src_key, dst_key) {
                            pairs.push((item.key.clone(), rebased));
                        }
                    }
                    match page.next_continuation {
                        Some(token) => continuation = Some(token),
                        None => break,
                    }
                }
                // the directory's own marker, when the scheme uses one
                if self.shared.caps.dir_markers == DirMarkerScheme::TrailingSlash {
                    let src_marker = keys::dir_marker_key(src_key);
                    let head = self
                        .shared
                        .backend
                        .head_blob(HeadBlobInput {
                            key: src_marker.clone(),
                        })
                        .await;
                    if head.is_ok() {
                        pairs.push((src_marker, keys::dir_marker_key(dst_key)));
                    }
                }
                self.shared.rename.rename_tree(pairs).await
            }
        }
    }

    /// Drains every dirty inode and shuts the mount down.
    ///
    /// Without `force`, unflushable data refuses the unmount; with it, the
    /// failure is logged and the dirty data discarded.
    pub async fn unmount(&self, force: bool) -> Result<()> {
        // stop new reads and readahead; flushes below drain under the deadline
        self.shared.cancel_handle.cancel(CancelReason::Unmount);

        let drain = async {
            self.quiesce().await;
            let mut first_error: Option<FsError> = None;
            for ino in self.shared.table.all_ids() {
                let inode = match self.shared.table.get(ino) {
                    Some(i) => i,
                    None => continue,
                };
                if inode.kind != InodeKind::File {
                    continue;
                }
                if let Err(e) = self
                    .shared
                    .flusher
                    .flush_inode(&self.shared.table, &inode)
                    .await
                {
                    first_error.get_or_insert(e);
                }
            }
            first_error
        };

        let outcome = tokio::time::timeout(self.shared.config.unmount_deadline, drain).await;
        let failure = match outcome {
            Ok(None) => None,
            Ok(Some(e)) => Some(e),
            Err(_) => Some(FsError::Busy {
                reason: "unmount deadline exceeded".to_string(),
            }),
        };

        if let Some(e) = failure {
            if !force {
                return Err(e);
            }
            warn!("forced unmount discards dirty data: {}", e);
            for ino in self.shared.table.all_ids() {
                if let Some(inode) = self.shared.table.get(ino) {
                    let (res, acc) = {
                        let mut file = inode.file.lock().unwrap();
                        let acc = file.buffers.accountable_bytes();
                        (file.buffers.clear(), acc)
                    };
                    self.shared.pool.apply_delta(-(res as i64), -(acc as i64));
                }
            }
        }

        if let Some(spill) = &self.shared.spill {
            spill.scan_and_reap();
        }
        info!("unmounted");
        Ok(())
    }

    // ---- internals ----

    fn require_dir(&self, ino: InodeId) -> Result<Arc<Inode>> {
        let inode = self.shared.table.require(ino)?;
        if inode.kind != InodeKind::Directory {
            return Err(FsError::NotDirectory { ino });
        }
        Ok(inode)
    }

    fn handle_entry(&self, fh: FileHandle) -> Result<crate::handle::HandleEntry> {
        self.shared
            .handles
            .lock()
            .unwrap()
            .get(fh)
            .cloned()
            .ok_or(FsError::BadHandle { fh })
    }

    fn check_sticky(&self, inode: &Arc<Inode>) -> Result<()> {
        let file = inode.file.lock().unwrap();
        match &file.sticky_error {
            Some(message) => Err(FsError::Io {
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Resolves a child, probing the backend when the cache cannot answer.
    async fn lookup_inode(&self, parent: InodeId, name: &str) -> Result<Arc<Inode>> {
        let parent_inode = self.require_dir(parent)?;
        if !keys::valid_name(name) {
            return Err(FsError::invalid(format!("bad name {:?}", name)));
        }

        if let Some(child) = self.shared.table.lookup_child(&parent_inode, name) {
            return Ok(child);
        }
        {
            let dir = parent_inode.dir.read().unwrap();
            if dir
                .negative
                .contains(name, self.shared.config.negative_ttl)
            {
                return Err(FsError::not_found(name));
            }
            if dir.listing.is_fresh(self.shared.config.listing_ttl) {
                // a fresh complete listing is authoritative
                drop(dir);
                parent_inode.dir.write().unwrap().negative.insert(name);
                return Err(FsError::not_found(name));
            }
        }

        let parent_key = self.shared.table.key_of(parent)?;
        let key = keys::join_key(&parent_key, name);

        match self.probe_remote(&key).await? {
            Some((kind, size, etag, mtime, metadata, storage_class)) => {
                let (mode, uid, gid, mtime) =
                    attrs_from_metadata(&metadata, kind, mtime, 0, 0);
                let inode = self.shared.table.alloc(
                    &parent_inode,
                    name,
                    kind,
                    mode,
                    uid,
                    gid,
                    InodeState::Clean,
                )?;
                {
                    let mut meta = inode.meta.write().unwrap();
                    if kind == InodeKind::File {
                        meta.size = size;
                        meta.remote_size = Some(size);
                    }
                    meta.etag = etag;
                    meta.mtime = mtime;
                    meta.storage_class = storage_class;
                    meta.symlink_target = metadata.get(meta_keys::META_SYMLINK).cloned();
                    if meta.symlink_target.is_some() {
                        // a metadata symlink flag outranks the blob shape
                        meta.size = meta
                            .symlink_target
                            .as_ref()
                            .map(|t| t.len() as u64)
                            .unwrap_or(0);
                    }
                    meta.lookup_count = 0;
                }
                Ok(inode)
            }
            None => {
                parent_inode.dir.write().unwrap().negative.insert(name);
                Err(FsError::not_found(name))
            }
        }
    }

    /// Head/list probe for a key that is not materialised locally.
    #[allow(clippy::type_complexity)]
    async fn probe_remote(
        &self,
        key: &str,
    ) -> Result<
        Option<(
            InodeKind,
            u64,
            Option<String>,
            SystemTime,
            BlobMetadata,
            Option<String>,
        )>,
    > {
        let _permit = self.shared.gates.acquire_small().await;

        let head = self
            .shared
            .backend
            .head_blob(HeadBlobInput {
                key: key.to_string(),
            })
            .await;
        match head {
            Ok(out) => {
                if RenameEngine::resolve_forward(&out.metadata).is_some() {
                    // mid-rename: the object now lives at the forward target
                    return Ok(None);
                }
                let kind = if out.metadata.contains_key(meta_keys::META_SYMLINK) {
                    InodeKind::Symlink
                } else {
                    InodeKind::File
                };
                return Ok(Some((
                    kind,
                    out.size,
                    Some(out.etag),
                    out.mtime,
                    out.metadata,
                    out.storage_class,
                )));
            }
            Err(BackendError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        // marker probe
        let marker = keys::dir_marker_key(key);
        match self
            .shared
            .backend
            .head_blob(HeadBlobInput { key: marker })
            .await
        {
            Ok(out) => {
                return Ok(Some((
                    InodeKind::Directory,
                    0,
                    Some(out.etag),
                    out.mtime,
                    out.metadata,
                    out.storage_class,
                )))
            }
            Err(BackendError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        // implicit directory: any key under the prefix proves it
        let page = self
            .shared
            .backend
            .list_blobs(ListBlobsInput {
                prefix: Some(keys::children_prefix(key)),
                delimiter: None,
                continuation: None,
                max_keys: 1,
            })
            .await?;
        if !page.items.is_empty() {
            return Ok(Some((
                InodeKind::Directory,
                0,
                None,
                SystemTime::now(),
                BlobMetadata::new(),
                None,
            )));
        }
        Ok(None)
    }

    /// Brings a directory's child map up to date with the backend listing.
    async fn ensure_listed(&self, inode: &Arc<Inode>) -> Result<()> {
        {
            let dir = inode.dir.read().unwrap();
            if dir.listing.is_fresh(self.shared.config.listing_ttl) {
                return Ok(());
            }
        }

        let dir_key = self.shared.table.key_of(inode.id)?;
        let prefix = keys::children_prefix(&dir_key);
        let mut continuation: Option<String> = None;
        let mut seen: Vec<String> = Vec::new();

        loop {
            let _permit = self.shared.gates.acquire_small().await;
            let page = self
                .shared
                .retry
                .execute(|| {
                    self.shared.backend.list_blobs(ListBlobsInput {
                        prefix: Some(prefix.clone()),
                        delimiter: Some("/".to_string()),
                        continuation: continuation.clone(),
                        max_keys: self.shared.caps.max_list_page,
                    })
                })
                .await
                .into_result()?;
            drop(_permit);

            let entries = merge_page(&prefix, &page);
            for entry in entries {
                seen.push(entry.name.clone());
                let existing = self.shared.table.lookup_child(inode, &entry.name);
                match existing {
                    Some(child) => {
                        // refresh clean files only; local changes win
                        if child.kind == InodeKind::File {
                            let mut meta = child.meta.write().unwrap();
                            if meta.state == InodeState::Clean
                                && meta.etag != entry.etag
                                && entry.etag.is_some()
                            {
                                meta.size = entry.size;
                                meta.remote_size = Some(entry.size);
                                meta.etag = entry.etag.clone();
                                if let Some(mtime) = entry.mtime {
                                    meta.mtime = mtime;
                                }
                            }
                        }
                    }
                    None => {
                        let child = self.shared.table.alloc(
                            inode,
                            &entry.name,
                            entry.kind,
                            default_mode(entry.kind),
                            0,
                            0,
                            InodeState::Clean,
                        )?;
                        let mut meta = child.meta.write().unwrap();
                        meta.size = entry.size;
                        if entry.kind == InodeKind::File {
                            meta.remote_size = Some(entry.size);
                        }
                        meta.etag = entry.etag.clone();
                        if let Some(mtime) = entry.mtime {
                            meta.mtime = mtime;
                        }
                        meta.storage_class = entry.storage_class.clone();
                        meta.lookup_count = 0;
                    }
                }
            }

            match page.next_continuation {
                Some(token) => {
                    continuation = Some(token.clone());
                    inode.dir.write().unwrap().listing = ListingState::Partial {
                        continuation: token,
                        at: std::time::Instant::now(),
                    };
                }
                None => break,
            }
        }

        // names the listing no longer carries: drop clean, unopened children
        let stale: Vec<Arc<Inode>> = {
            let dir = inode.dir.read().unwrap();
            dir.children
                .iter()
                .filter(|(name, _)| !seen.contains(name))
                .filter_map(|(_, id)| self.shared.table.get(*id))
                .filter(|child| {
                    let meta = child.meta.read().unwrap();
                    meta.state == InodeState::Clean && meta.open_count == 0
                })
                .collect()
        };
        for child in stale {
            let name = child.meta.read().unwrap().name.clone();
            let _ = self.shared.table.detach_child(inode, &name);
            child.meta.write().unwrap().state = InodeState::Deleted;
            self.shared.table.try_reclaim(&child);
        }

        inode.dir.write().unwrap().listing = ListingState::Complete {
            at: std::time::Instant::now(),
        };
        Ok(())
    }

    /// Fetches any uncached range of `[offset, offset+len)` into the cache.
    ///
    /// Concurrent readers of the same range share one fetch: the first
    /// caller marks the range as fetching and issues the request, later
    /// callers wait on its wait-group and re-check.
    async fn populate_range(&self, inode: &Arc<Inode>, offset: u64, len: u64) -> Result<()> {
        'refill: loop {
            self.shared.check_cancelled()?;
            let (missing, size, state, etag) = {
                let meta = inode.meta.read().unwrap();
                let file = inode.file.lock().unwrap();
                (
                    file.buffers.missing_ranges(offset, len, meta.size),
                    meta.size,
                    meta.state.clone(),
                    meta.etag.clone(),
                )
            };
            if missing.is_empty() {
                return Ok(());
            }

            for (m_offset, m_len) in missing {
                if state == InodeState::NewFile {
                    // no remote object: uncached ranges are holes
                    let mut file = inode.file.lock().unwrap();
                    file.buffers.zero_fill(m_offset, m_offset + m_len);
                    continue;
                }
                // widen to the fetch chunk to amortise request latency
                let chunk = self.shared.config.read_chunk.max(1);
                let f_start = (m_offset / chunk) * chunk;
                let f_end = ((m_offset + m_len).div_ceil(chunk) * chunk).min(size);
                let range = (f_start, f_end - f_start);

                let waiter = {
                    let mut file = inode.file.lock().unwrap();
                    match file.fetching.get(&range) {
                        Some(notify) => Some(Arc::clone(notify)),
                        None => {
                            file.fetching.insert(range, Arc::new(tokio::sync::Notify::new()));
                            None
                        }
                    }
                };
                if let Some(notify) = waiter {
                    // the wait-group future must exist before the re-check,
                    // or a completion between the two is lost
                    let notified = notify.notified();
                    let still_fetching =
                        inode.file.lock().unwrap().fetching.contains_key(&range);
                    if still_fetching {
                        notified.await;
                    }
                    continue 'refill;
                }

                let outcome = self
                    .fetch_and_install(inode, range.0, range.1, etag.clone())
                    .await;
                let notify = {
                    let mut file = inode.file.lock().unwrap();
                    file.fetching.remove(&range)
                };
                if let Some(notify) = notify {
                    notify.notify_waiters();
                }
                outcome?;
            }
        }
    }

    /// One ranged GET, etag-revalidated, installed as clean pages.
    async fn fetch_and_install(
        &self,
        inode: &Arc<Inode>,
        offset: u64,
        len: u64,
        etag: Option<String>,
    ) -> Result<()> {
        let key = self.shared.table.key_of(inode.id)?;
        let _permit = self.shared.gates.acquire_bulk().await;

        let mut if_match = etag;
        let out = loop {
            let attempt = self
                .shared
                .retry
                .execute(|| {
                    self.shared.backend.get_blob(GetBlobInput {
                        key: key.clone(),
                        range: Some((offset, len)),
                        if_match: if_match.clone(),
                    })
                })
                .await
                .into_result();
            match attempt {
                Ok(out) => break out,
                Err(BackendError::PreconditionFailed { .. }) if if_match.is_some() => {
                    // the object changed under us: drop the cached etag and
                    // the stale clean pages, then take whatever is current
                    if_match = None;
                    inode.meta.write().unwrap().etag = None;
                    let freed = {
                        let mut file = inode.file.lock().unwrap();
                        file.buffers.invalidate_clean()
                    };
                    self.shared.pool.apply_delta(-(freed as i64), 0);
                    self.shared.pool.forget_inode(inode.id);
                }
                Err(e) => return Err(e.into()),
            }
        };

        let meta_size = {
            let mut meta = inode.meta.write().unwrap();
            if meta.etag.is_none() {
                meta.etag = Some(out.etag.clone());
            }
            meta.size
        };
        let installed = {
            let mut file = inode.file.lock().unwrap();
            let before = file.buffers.resident_bytes();
            if (out.data.len() as u64) < len {
                let data_end = offset + out.data.len() as u64;
                let fill_end = (offset + len).min(meta_size);
                if fill_end > data_end {
                    file.buffers.zero_fill(data_end, fill_end);
                }
            }
            file.buffers.install_clean(offset, &out.data);
            file.buffers.resident_bytes() - before
        };
        self.shared.pool.apply_delta(installed as i64, 0);
        for (off, plen) in inode.file.lock().unwrap().buffers.clean_resident() {
            if off >= offset && off < offset + len {
                self.shared.pool.touch_clean(inode.id, off, plen);
            }
        }
        Ok(())
    }

    fn spawn_flush(&self, inode: &Arc<Inode>) {
        let shared = Arc::clone(&self.shared);
        let inode = Arc::clone(inode);
        let handle = tokio::spawn(async move {
            if let Err(e) = shared.flusher.flush_inode(&shared.table, &inode).await {
                warn!("background flush of inode {} failed: {}", inode.id, e);
            }
        });
        self.shared.tasks.lock().unwrap().push(handle);
    }

    fn spawn_prefetch(&self, inode: &Arc<Inode>, offset: u64, len: u64) {
        let shared = Arc::clone(&self.shared);
        let inode = Arc::clone(inode);
        let handle = tokio::spawn(async move {
            let fs = TideFs { shared };
            if let Err(e) = fs.populate_range(&inode, offset, len).await {
                debug!("readahead for inode {} failed: {}", inode.id, e);
            }
        });
        self.shared.tasks.lock().unwrap().push(handle);
    }

    /// Keeps resident memory inside the budget: evict clean pages first,
    /// then queue and spill dirty buffers of the writing inode.
    fn enforce_budget(&self, writing: &Arc<Inode>) {
        let overshoot = match self.shared.pool.over_budget() {
            Some(n) => n,
            None => return,
        };

        let victims = self.shared.pool.evict_victims(overshoot);
        for victim in victims {
            if let Some(inode) = self.shared.table.get(victim.ino) {
                let freed = inode.file.lock().unwrap().buffers.evict_clean(victim.offset);
                if freed > 0 {
                    self.shared.pool.apply_delta(-(freed as i64), 0);
                }
            }
        }

        // still over: dirty data is what remains, spill the writer's queue
        if self.shared.pool.over_budget().is_some() {
            if let Some(spill) = &self.shared.spill {
                let queued = {
                    let mut file = writing.file.lock().unwrap();
                    file.buffers.queue_dirty();
                    file.buffers.queued_resident()
                };
                for (offset, qlen) in queued {
                    let (data, generation) = {
                        let mut file = writing.file.lock().unwrap();
                        let segs = match file.buffers.read(offset, qlen, offset + qlen) {
                            Ok(s) => s,
                            Err(_) => continue,
                        };
                        let mut data = Vec::with_capacity(qlen as usize);
                        for seg in segs {
                            if let crate::buffer::ReadSegment::Data { bytes, .. } = seg {
                                data.extend_from_slice(&bytes);
                            }
                        }
                        (data, file.buffers.reserve_generation())
                    };
                    match spill.write(writing.id, generation, &data) {
                        Ok(handle) => {
                            let freed = writing
                                .file
                                .lock()
                                .unwrap()
                                .buffers
                                .spill_queued(offset, handle);
                            if freed > 0 {
                                self.shared.pool.apply_delta(-(freed as i64), 0);
                            }
                        }
                        Err(e) => warn!("spill of inode {} failed: {}", writing.id, e),
                    }
                }
            }
            self.spawn_flush(writing);
        }
    }

    /// All file inodes in the subtree rooted at `inode` (inclusive).
    fn subtree_files(&self, inode: &Arc<Inode>) -> Vec<Arc<Inode>> {
        let mut files = Vec::new();
        let mut stack = vec![Arc::clone(inode)];
        while let Some(node) = stack.pop() {
            match node.kind {
                InodeKind::File => files.push(node),
                InodeKind::Directory => {
                    let ids: Vec<InodeId> =
                        node.dir.read().unwrap().children.values().copied().collect();
                    for id in ids {
                        if let Some(child) = self.shared.table.get(id) {
                            stack.push(child);
                        }
                    }
                }
                InodeKind::Symlink => {}
            }
        }
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidefs_backend::{MemoryBackend, StorageBackend};

    struct Mounted {
        fs: TideFs,
        backend: Arc<MemoryBackend>,
    }

    async fn mount() -> Mounted {
        let mut caps = Capabilities::s3_defaults("memory");
        caps.min_part_size = 8;
        caps.max_part_size = 64;
        let backend = Arc::new(MemoryBackend::with_capabilities(caps));
        let fs = TideFs::mount(
            MountConfig::small_for_tests(),
            backend.clone() as DynBackend,
        )
        .await
        .unwrap();
        Mounted { fs, backend }
    }

    async fn write_file(m: &Mounted, parent: InodeId, name: &str, data: &[u8]) -> InodeId {
        let (attr, fh) = m.fs.create(parent, name, 0o644).await.unwrap();
        m.fs.write(fh, 0, data).await.unwrap();
        m.fs.release(fh).await.unwrap();
        attr.ino
    }

    #[tokio::test]
    async fn create_write_close_reopen_read() {
        let m = mount().await;
        let ino = write_file(&m, ROOT_INODE, "a.txt", b"hello").await;

        let attr = m.fs.lookup(ROOT_INODE, "a.txt").await.unwrap();
        assert_eq!(attr.ino, ino);
        assert_eq!(attr.size, 5);

        let fh = m.fs.open(ino, OpenFlags::ReadOnly).unwrap();
        let bytes = m.fs.read(fh, 0, 5).await.unwrap();
        assert_eq!(bytes, b"hello");
        m.fs.release(fh).await.unwrap();

        // the backend holds exactly one key
        assert_eq!(m.backend.keys(), vec!["a.txt".to_string()]);
    }

    #[tokio::test]
    async fn release_blocks_until_flushed() {
        let m = mount().await;
        let (_, fh) = m.fs.create(ROOT_INODE, "f", 0o644).await.unwrap();
        m.fs.write(fh, 0, b"payload").await.unwrap();
        assert!(m.backend.object_data("f").is_none());

        m.fs.release(fh).await.unwrap();
        assert_eq!(m.backend.object_data("f").unwrap(), b"payload");
    }

    #[tokio::test]
    async fn create_unlink_lookup_is_not_found() {
        let m = mount().await;
        write_file(&m, ROOT_INODE, "gone", b"x").await;

        m.fs.unlink(ROOT_INODE, "gone").await.unwrap();
        let err = m.fs.lookup(ROOT_INODE, "gone").await.unwrap_err();
        assert!(matches!(err, FsError::NotFound { .. }));
        assert!(m.backend.object_data("gone").is_none());
    }

    #[tokio::test]
    async fn lookup_discovers_seeded_object() {
        let m = mount().await;
        m.backend
            .seed_object("remote.bin", vec![9u8; 42], BlobMetadata::new());

        let attr = m.fs.lookup(ROOT_INODE, "remote.bin").await.unwrap();
        assert_eq!(attr.size, 42);
        assert_eq!(attr.kind, InodeKind::File);
    }

    #[tokio::test]
    async fn negative_lookup_is_cached() {
        let m = mount().await;
        let _ = m.fs.lookup(ROOT_INODE, "absent").await.unwrap_err();
        let probes = m.backend.stats().heads + m.backend.stats().lists;

        let _ = m.fs.lookup(ROOT_INODE, "absent").await.unwrap_err();
        assert_eq!(m.backend.stats().heads + m.backend.stats().lists, probes);
    }

    #[tokio::test]
    async fn mkdir_then_readdir_and_lookup() {
        let m = mount().await;
        let attr = m.fs.mkdir(ROOT_INODE, "docs", 0o755).await.unwrap();
        assert_eq!(attr.kind, InodeKind::Directory);
        assert!(m.backend.object_data("docs/").is_some());

        let entries = m.fs.readdir(ROOT_INODE).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "docs");
        assert_eq!(entries[0].kind, InodeKind::Directory);
    }

    #[tokio::test]
    async fn rmdir_refuses_non_empty_then_succeeds() {
        let m = mount().await;
        let dir = m.fs.mkdir(ROOT_INODE, "d", 0o755).await.unwrap();
        write_file(&m, dir.ino, "f", b"x").await;

        let err = m.fs.rmdir(ROOT_INODE, "d").await.unwrap_err();
        assert!(matches!(err, FsError::NotEmpty { .. }));

        m.fs.unlink(dir.ino, "f").await.unwrap();
        m.fs.rmdir(ROOT_INODE, "d").await.unwrap();
        assert!(m.backend.object_data("d/").is_none());
        assert!(matches!(
            m.fs.lookup(ROOT_INODE, "d").await.unwrap_err(),
            FsError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn rmdir_of_missing_is_not_found() {
        let m = mount().await;
        let err = m.fs.rmdir(ROOT_INODE, "ghost").await.unwrap_err();
        assert!(matches!(err, FsError::NotFound { .. }));
    }

    #[tokio::test]
    async fn write_past_end_reads_back_zeros() {
        let m = mount().await;
        let (attr, fh) = m.fs.create(ROOT_INODE, "sparse", 0o644).await.unwrap();
        m.fs.write(fh, 8, b"xx").await.unwrap();

        let bytes = m.fs.read(fh, 0, 10).await.unwrap();
        assert_eq!(bytes, b"\0\0\0\0\0\0\0\0xx");
        assert_eq!(m.fs.getattr(attr.ino).unwrap().size, 10);

        m.fs.release(fh).await.unwrap();
        assert_eq!(m.backend.object_data("sparse").unwrap(), b"\0\0\0\0\0\0\0\0xx");
    }

    #[tokio::test]
    async fn large_write_crosses_into_multipart() {
        let m = mount().await;
        let body: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        let ino = write_file(&m, ROOT_INODE, "big", &body).await;
        m.fs.quiesce().await;

        assert_eq!(m.backend.object_data("big").unwrap(), body);
        assert!(m.backend.stats().commits >= 1);

        // multipart etag shape, not a plain body digest
        let inode = m.fs.shared.table.require(ino).unwrap();
        let etag = inode.meta.read().unwrap().etag.clone().unwrap();
        assert!(etag.contains('-'));
    }

    #[tokio::test]
    async fn overlapping_writes_last_writer_wins() {
        let m = mount().await;
        let (attr, fh_a) = m.fs.create(ROOT_INODE, "overlap", 0o644).await.unwrap();
        let fh_b = m.fs.open(attr.ino, OpenFlags::ReadWrite).unwrap();

        m.fs.write(fh_a, 0, &[0xAA; 8]).await.unwrap();
        m.fs.write(fh_b, 4, &[0xBB; 8]).await.unwrap();

        m.fs.release(fh_a).await.unwrap();
        m.fs.release(fh_b).await.unwrap();

        let stored = m.backend.object_data("overlap").unwrap();
        assert_eq!(&stored[..4], &[0xAA; 4]);
        assert_eq!(&stored[4..12], &[0xBB; 8]);
    }

    #[tokio::test]
    async fn setattr_truncate_and_extend() {
        let m = mount().await;
        let ino = write_file(&m, ROOT_INODE, "t", b"0123456789").await;

        let attr = m
            .fs
            .setattr(
                ino,
                SetAttr {
                    size: Some(4),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(attr.size, 4);

        let attr = m
            .fs
            .setattr(
                ino,
                SetAttr {
                    size: Some(8),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(attr.size, 8);

        let fh = m.fs.open(ino, OpenFlags::ReadWrite).unwrap();
        let bytes = m.fs.read(fh, 0, 8).await.unwrap();
        assert_eq!(bytes, b"0123\0\0\0\0");
        m.fs.release(fh).await.unwrap();
        assert_eq!(m.backend.object_data("t").unwrap(), b"0123\0\0\0\0");
    }

    #[tokio::test]
    async fn chmod_flushes_metadata() {
        let m = mount().await;
        let ino = write_file(&m, ROOT_INODE, "m", b"x").await;

        m.fs.setattr(
            ino,
            SetAttr {
                mode: Some(0o600),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let fh = m.fs.open(ino, OpenFlags::ReadWrite).unwrap();
        m.fs.release(fh).await.unwrap();

        let head = m
            .backend
            .head_blob(HeadBlobInput {
                key: "m".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(head.metadata.get("mode").map(String::as_str), Some("600"));
    }

    #[tokio::test]
    async fn rename_file_moves_key_and_bytes() {
        let m = mount().await;
        write_file(&m, ROOT_INODE, "old", b"content").await;

        m.fs.rename(ROOT_INODE, "old", ROOT_INODE, "new").await.unwrap();

        assert!(m.backend.object_data("old").is_none());
        assert_eq!(m.backend.object_data("new").unwrap(), b"content");
        assert!(m.fs.lookup(ROOT_INODE, "old").await.is_err());
        let attr = m.fs.lookup(ROOT_INODE, "new").await.unwrap();
        assert_eq!(attr.size, 7);
    }

    #[tokio::test]
    async fn rename_unflushed_file_flushes_first() {
        let m = mount().await;
        let (_, fh) = m.fs.create(ROOT_INODE, "fresh", 0o644).await.unwrap();
        m.fs.write(fh, 0, b"data").await.unwrap();

        m.fs.rename(ROOT_INODE, "fresh", ROOT_INODE, "moved")
            .await
            .unwrap();
        m.fs.release(fh).await.unwrap();

        assert_eq!(m.backend.object_data("moved").unwrap(), b"data");
        assert!(m.backend.object_data("fresh").is_none());
    }

    #[tokio::test]
    async fn rename_non_empty_directory() {
        let m = mount().await;
        let d = m.fs.mkdir(ROOT_INODE, "d", 0o755).await.unwrap();
        let sub = m.fs.mkdir(d.ino, "sub", 0o755).await.unwrap();
        write_file(&m, d.ino, "f1", &[1u8; 128]).await;
        write_file(&m, sub.ino, "f2", &[2u8; 128]).await;

        m.fs.rename(ROOT_INODE, "d", ROOT_INODE, "e").await.unwrap();

        let names: Vec<String> = m
            .fs
            .readdir(ROOT_INODE)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["e".to_string()]);

        let e_attr = m.fs.lookup(ROOT_INODE, "e").await.unwrap();
        let e_names: Vec<String> = m
            .fs
            .readdir(e_attr.ino)
            .await
            .unwrap()
            .into_iter()
            .map(|en| en.name)
            .collect();
        assert_eq!(e_names, vec!["f1".to_string(), "sub".to_string()]);

        let e_sub = m.fs.lookup(e_attr.ino, "sub").await.unwrap();
        let sub_names: Vec<String> = m
            .fs
            .readdir(e_sub.ino)
            .await
            .unwrap()
            .into_iter()
            .map(|en| en.name)
            .collect();
        assert_eq!(sub_names, vec!["f2".to_string()]);

        assert!(m.backend.object_data("d/f1").is_none());
        assert!(m.backend.object_data("d/sub/f2").is_none());
        assert_eq!(m.backend.object_data("e/f1").unwrap(), vec![1u8; 128]);
        assert_eq!(m.backend.object_data("e/sub/f2").unwrap(), vec![2u8; 128]);
    }

    #[tokio::test]
    async fn rename_rollback_on_copy_failure() {
        let m = mount().await;
        let d = m.fs.mkdir(ROOT_INODE, "d", 0o755).await.unwrap();
        write_file(&m, d.ino, "f1", b"one").await;
        write_file(&m, d.ino, "f2", b"two").await;

        m.backend.inject_failure(
            "copy",
            BackendError::Permission {
                key: "d/f2".to_string(),
                op: "copy",
            },
        );

        let err = m
            .fs
            .rename(ROOT_INODE, "d", ROOT_INODE, "e")
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Permission { .. }));

        // no delete was issued; the source directory is intact
        assert_eq!(m.backend.object_data("d/f1").unwrap(), b"one");
        assert_eq!(m.backend.object_data("d/f2").unwrap(), b"two");
        let names: Vec<String> = m
            .fs
            .readdir(d.ino)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["f1".to_string(), "f2".to_string()]);
        assert!(m.fs.lookup(ROOT_INODE, "e").await.is_err());
    }

    #[tokio::test]
    async fn readdir_merges_remote_listing() {
        let m = mount().await;
        m.backend
            .seed_object("x.txt", b"1".to_vec(), BlobMetadata::new());
        m.backend
            .seed_object("dir/y.txt", b"2".to_vec(), BlobMetadata::new());

        let names: Vec<(String, InodeKind)> = m
            .fs
            .readdir(ROOT_INODE)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.kind))
            .collect();
        assert_eq!(
            names,
            vec![
                ("dir".to_string(), InodeKind::Directory),
                ("x.txt".to_string(), InodeKind::File),
            ]
        );
    }

    #[tokio::test]
    async fn readdir_hides_file_shadowed_by_directory() {
        let m = mount().await;
        m.backend
            .seed_object("foo", b"file".to_vec(), BlobMetadata::new());
        m.backend
            .seed_object("foo/child", b"x".to_vec(), BlobMetadata::new());

        let entries = m.fs.readdir(ROOT_INODE).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "foo");
        assert_eq!(entries[0].kind, InodeKind::Directory);
    }

    #[tokio::test]
    async fn symlink_round_trips_through_metadata() {
        let m = mount().await;
        let attr = m
            .fs
            .symlink(ROOT_INODE, "link", "target/path")
            .await
            .unwrap();
        assert_eq!(attr.kind, InodeKind::Symlink);

        let target = m.fs.readlink(attr.ino).await.unwrap();
        assert_eq!(target, "target/path");

        let head = m
            .backend
            .head_blob(HeadBlobInput {
                key: "link".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            head.metadata.get(meta_keys::META_SYMLINK).map(String::as_str),
            Some("target/path")
        );
    }

    #[tokio::test]
    async fn remote_symlink_is_discovered_as_symlink() {
        let m = mount().await;
        let mut metadata = BlobMetadata::new();
        metadata.insert(meta_keys::META_SYMLINK.to_string(), "else/where".to_string());
        m.backend.seed_object("l", Vec::new(), metadata);

        let attr = m.fs.lookup(ROOT_INODE, "l").await.unwrap();
        assert_eq!(attr.kind, InodeKind::Symlink);
        assert_eq!(m.fs.readlink(attr.ino).await.unwrap(), "else/where");
    }

    #[tokio::test]
    async fn sticky_error_surfaces_until_reopen() {
        let m = mount().await;
        let (attr, fh) = m.fs.create(ROOT_INODE, "f", 0o644).await.unwrap();
        m.fs.write(fh, 0, b"data").await.unwrap();
        m.backend.inject_failure(
            "put",
            BackendError::Permission {
                key: "f".to_string(),
                op: "put",
            },
        );

        let err = m.fs.release(fh).await.unwrap_err();
        assert!(matches!(err, FsError::Permission { .. }));

        // reopen clears the sticky error and the flush succeeds
        let fh2 = m.fs.open(attr.ino, OpenFlags::ReadWrite).unwrap();
        m.fs.release(fh2).await.unwrap();
        assert_eq!(m.backend.object_data("f").unwrap(), b"data");
    }

    #[tokio::test]
    async fn write_through_readonly_handle_is_denied() {
        let m = mount().await;
        let ino = write_file(&m, ROOT_INODE, "ro", b"x").await;
        let fh = m.fs.open(ino, OpenFlags::ReadOnly).unwrap();

        let err = m.fs.write(fh, 0, b"nope").await.unwrap_err();
        assert!(matches!(err, FsError::Permission { .. }));
        m.fs.release(fh).await.unwrap();
    }

    #[tokio::test]
    async fn read_through_stale_handle_is_rejected() {
        let m = mount().await;
        let err = m.fs.read(999, 0, 10).await.unwrap_err();
        assert!(matches!(err, FsError::BadHandle { .. }));
    }

    #[tokio::test]
    async fn sequential_reads_prefetch_ahead() {
        let m = mount().await;
        let body: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        m.backend
            .seed_object("seq", body.clone(), BlobMetadata::new());

        let attr = m.fs.lookup(ROOT_INODE, "seq").await.unwrap();
        let fh = m.fs.open(attr.ino, OpenFlags::ReadOnly).unwrap();

        assert_eq!(m.fs.read(fh, 0, 64).await.unwrap(), &body[..64]);
        assert_eq!(m.fs.read(fh, 64, 64).await.unwrap(), &body[64..128]);
        m.fs.quiesce().await;

        // the readahead window already covers the next chunk
        let gets_before = m.backend.stats().gets;
        assert_eq!(m.fs.read(fh, 128, 64).await.unwrap(), &body[128..192]);
        assert_eq!(m.backend.stats().gets, gets_before);
        m.fs.release(fh).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_reads_of_one_range_share_a_fetch() {
        let m = mount().await;
        m.backend
            .seed_object("dup", vec![3u8; 64], BlobMetadata::new());
        let attr = m.fs.lookup(ROOT_INODE, "dup").await.unwrap();

        let fh1 = m.fs.open(attr.ino, OpenFlags::ReadOnly).unwrap();
        let fh2 = m.fs.open(attr.ino, OpenFlags::ReadOnly).unwrap();
        let (r1, r2) = tokio::join!(m.fs.read(fh1, 0, 64), m.fs.read(fh2, 0, 64));
        assert_eq!(r1.unwrap(), vec![3u8; 64]);
        assert_eq!(r2.unwrap(), vec![3u8; 64]);

        // one ranged GET serves both readers
        assert_eq!(m.backend.stats().gets, 1);
        m.fs.release(fh1).await.unwrap();
        m.fs.release(fh2).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_readers_see_identical_bytes() {
        let m = mount().await;
        let body = vec![7u8; 300];
        m.backend
            .seed_object("shared", body.clone(), BlobMetadata::new());
        let attr = m.fs.lookup(ROOT_INODE, "shared").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(m.fs.open(attr.ino, OpenFlags::ReadOnly).unwrap());
        }
        for fh in &handles {
            assert_eq!(m.fs.read(*fh, 0, 300).await.unwrap(), body);
        }
        for fh in handles {
            m.fs.release(fh).await.unwrap();
        }
    }

    #[tokio::test]
    async fn unmount_refuses_unflushable_data_unless_forced() {
        let m = mount().await;
        let (_, fh) = m.fs.create(ROOT_INODE, "stuck", 0o644).await.unwrap();
        m.fs.write(fh, 0, b"data").await.unwrap();
        m.backend.inject_failure(
            "put",
            BackendError::Permission {
                key: "stuck".to_string(),
                op: "put",
            },
        );

        let err = m.fs.unmount(false).await.unwrap_err();
        assert!(matches!(err, FsError::Permission { .. } | FsError::Io { .. }));

        m.fs.unmount(true).await.unwrap();
        assert_eq!(m.fs.pool_stats().dirty_bytes, 0);
    }

    #[tokio::test]
    async fn unmount_flushes_remaining_dirty_data() {
        let m = mount().await;
        let (_, fh) = m.fs.create(ROOT_INODE, "pending", 0o644).await.unwrap();
        m.fs.write(fh, 0, b"bytes").await.unwrap();

        m.fs.unmount(false).await.unwrap();
        assert_eq!(m.backend.object_data("pending").unwrap(), b"bytes");
    }

    #[tokio::test]
    async fn listing_prunes_remotely_deleted_entries() {
        let m = mount().await;
        m.backend
            .seed_object("temp", b"x".to_vec(), BlobMetadata::new());
        let entries = m.fs.readdir(ROOT_INODE).await.unwrap();
        assert_eq!(entries.len(), 1);

        // another client deletes the object; force a relist
        {
            let root = m.fs.shared.table.require(ROOT_INODE).unwrap();
            root.dir.write().unwrap().listing.invalidate();
        }
        m.backend
            .delete_blob("temp")
            .await
            .unwrap();

        let entries = m.fs.readdir(ROOT_INODE).await.unwrap();
        assert!(entries.is_empty());
    }
}

