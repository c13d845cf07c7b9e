//! The inode graph: authoritative in-memory filesystem state.
//!
//! Inodes are shared (`Arc`) and carry their own locks: an rwlock for
//! metadata, a mutex for the file buffer state, an rwlock for a directory's
//! child map. The table maps dense ids to inodes and owns allocation and
//! reclamation. Parent references are plain ids resolved through the table,
//! never owning pointers, so drop cycles cannot form.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use tokio::sync::Notify;
use tracing::debug;

use tidefs_backend::keys;

use crate::attr::{blocks_for_size, FileAttr};
use crate::buffer::BufferList;
use crate::dir_cache::{ListingState, NegativeCache};
use crate::error::{FsError, Result};
use crate::multipart::MultipartUpload;

/// Dense inode identifier; the mount root is always 1.
pub type InodeId = u64;

/// Id of the mount root.
pub const ROOT_INODE: InodeId = 1;

/// Inode kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

/// Lifecycle state of an inode relative to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeState {
    /// Matches the backend object.
    Clean,
    /// Data or metadata changed locally; a flush is owed.
    Modified,
    /// Created locally; no backend object exists yet.
    NewFile,
    /// Unlinked; the id stays alive until the kernel drops its references.
    Deleted,
    /// A backend rename to the recorded key is in flight.
    Renamed(String),
}

/// Mutable metadata of an inode, guarded by the per-inode rwlock.
#[derive(Debug)]
pub struct InodeMeta {
    /// Parent inode id (a lookup relation, not ownership).
    pub parent: InodeId,
    /// Final path component under the parent.
    pub name: String,
    /// Logical size in bytes.
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Link count.
    pub nlink: u32,
    /// Access time.
    pub atime: SystemTime,
    /// Modification time.
    pub mtime: SystemTime,
    /// Status-change time.
    pub ctime: SystemTime,
    /// Backend object identity at last observation.
    pub etag: Option<String>,
    /// Size of the backend object at last observation; `None` before the
    /// first upload. A logical size differing from this means the body must
    /// be rewritten even when no buffer is dirty (truncate, extend).
    pub remote_size: Option<u64>,
    /// Backend storage class at last observation.
    pub storage_class: Option<String>,
    /// Lifecycle state.
    pub state: InodeState,
    /// Kernel lookup references.
    pub lookup_count: u64,
    /// Open handle references.
    pub open_count: u32,
    /// Symlink target, for symlink inodes.
    pub symlink_target: Option<String>,
}

/// Per-file buffer and flush state, guarded by the per-inode mutex.
#[derive(Debug, Default)]
pub struct FileState {
    /// Ordered buffer list.
    pub buffers: BufferList,
    /// Whether a flusher run currently owns this inode.
    pub flushing: bool,
    /// In-flight multipart upload, when one exists.
    pub upload: Option<MultipartUpload>,
    /// Sticky flush error, surfaced on the next touch until reopen.
    pub sticky_error: Option<String>,
    /// Ranges currently being fetched, with the wait-group other readers of
    /// the same range block on instead of duplicating the request.
    pub fetching: HashMap<(u64, u64), Arc<Notify>>,
}

/// Per-directory state, guarded by the per-inode rwlock.
#[derive(Debug)]
pub struct DirState {
    /// Child map, name to inode id.
    pub children: HashMap<String, InodeId>,
    /// How much of the backend listing has been merged.
    pub listing: ListingState,
    /// Recently proven-absent names.
    pub negative: NegativeCache,
}

impl Default for DirState {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            listing: ListingState::Unlisted,
            negative: NegativeCache::new(),
        }
    }
}

/// One filesystem object.
pub struct Inode {
    /// Dense id.
    pub id: InodeId,
    /// Kind; immutable for the inode's lifetime.
    pub kind: InodeKind,
    /// Metadata.
    pub meta: RwLock<InodeMeta>,
    /// File buffer state (unused for directories and symlinks).
    pub file: Mutex<FileState>,
    /// Directory state (unused for files and symlinks).
    pub dir: RwLock<DirState>,
    /// Signalled whenever a flusher run on this inode finishes.
    pub flush_done: Notify,
}

impl Inode {
    /// Snapshot of the kernel-facing attributes.
    pub fn attr(&self) -> FileAttr {
        let meta = self.meta.read().unwrap();
        FileAttr {
            ino: self.id,
            size: meta.size,
            blocks: blocks_for_size(meta.size),
            atime: meta.atime,
            mtime: meta.mtime,
            ctime: meta.ctime,
            kind: self.kind,
            mode: meta.mode,
            nlink: meta.nlink,
            uid: meta.uid,
            gid: meta.gid,
        }
    }

    /// Whether the inode can be dropped from the table.
    pub fn reclaimable(&self) -> bool {
        let meta = self.meta.read().unwrap();
        meta.lookup_count == 0
            && meta.open_count == 0
            && matches!(meta.state, InodeState::Clean | InodeState::Deleted)
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// The id-to-inode table for one mount.
pub struct InodeTable {
    inodes: RwLock<HashMap<InodeId, Arc<Inode>>>,
    next_id: AtomicU64,
}

impl InodeTable {
    /// Creates a table holding only the root directory.
    pub fn new(root_uid: u32, root_gid: u32) -> Self {
        let now = SystemTime::now();
        let root = Arc::new(Inode {
            id: ROOT_INODE,
            kind: InodeKind::Directory,
            meta: RwLock::new(InodeMeta {
                parent: ROOT_INODE,
                name: String::new(),
                size: 4096,
                mode: 0o755,
                uid: root_uid,
                gid: root_gid,
                nlink: 2,
                atime: now,
                mtime: now,
                ctime: now,
                etag: None,
                remote_size: None,
                storage_class: None,
                state: InodeState::Clean,
                lookup_count: 1,
                open_count: 0,
                symlink_target: None,
            }),
            file: Mutex::new(FileState::default()),
            dir: RwLock::new(DirState::default()),
            flush_done: Notify::new(),
        });
        let mut map = HashMap::new();
        map.insert(ROOT_INODE, root);
        Self {
            inodes: RwLock::new(map),
            next_id: AtomicU64::new(2),
        }
    }

    /// Looks up an inode by id.
    pub fn get(&self, ino: InodeId) -> Option<Arc<Inode>> {
        self.inodes.read().unwrap().get(&ino).cloned()
    }

    /// Looks up an inode by id, failing with `NotFound`.
    pub fn require(&self, ino: InodeId) -> Result<Arc<Inode>> {
        self.get(ino)
            .ok_or_else(|| FsError::not_found(format!("inode {}", ino)))
    }

    /// Number of live inodes.
    pub fn len(&self) -> usize {
        self.inodes.read().unwrap().len()
    }

    /// Whether only nothing is tracked (never true: the root persists).
    pub fn is_empty(&self) -> bool {
        self.inodes.read().unwrap().is_empty()
    }

    /// Allocates an inode under `parent` and links it into the child map.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc(
        &self,
        parent: &Arc<Inode>,
        name: &str,
        kind: InodeKind,
        mode: u32,
        uid: u32,
        gid: u32,
        state: InodeState,
    ) -> Result<Arc<Inode>> {
        if parent.kind != InodeKind::Directory {
            return Err(FsError::NotDirectory { ino: parent.id });
        }
        if !keys::valid_name(name) {
            return Err(FsError::invalid(format!("bad name {:?}", name)));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = SystemTime::now();
        let (size, nlink) = match kind {
            InodeKind::Directory => (4096, 2),
            _ => (0, 1),
        };
        let inode = Arc::new(Inode {
            id,
            kind,
            meta: RwLock::new(InodeMeta {
                parent: parent.id,
                name: name.to_string(),
                size,
                mode,
                uid,
                gid,
                nlink,
                atime: now,
                mtime: now,
                ctime: now,
                etag: None,
                remote_size: None,
                storage_class: None,
                state,
                lookup_count: 1,
                open_count: 0,
                symlink_target: None,
            }),
            file: Mutex::new(FileState::default()),
            dir: RwLock::new(DirState::default()),
            flush_done: Notify::new(),
        });

        {
            let mut dir = parent.dir.write().unwrap();
            if dir.children.contains_key(name) {
                return Err(FsError::Exists {
                    name: name.to_string(),
                });
            }
            dir.children.insert(name.to_string(), id);
            dir.negative.remove(name);
        }
        if kind == InodeKind::Directory {
            parent.meta.write().unwrap().nlink += 1;
        }

        self.inodes.write().unwrap().insert(id, Arc::clone(&inode));
        debug!("alloc inode {} name={:?} kind={:?}", id, name, kind);
        Ok(inode)
    }

    /// Resolves a child by name through the parent's child map.
    pub fn lookup_child(&self, parent: &Arc<Inode>, name: &str) -> Option<Arc<Inode>> {
        if parent.kind != InodeKind::Directory {
            return None;
        }
        let id = *parent.dir.read().unwrap().children.get(name)?;
        self.get(id)
    }

    /// Unlinks `name` from the parent's child map; the inode stays in the
    /// table until its references drop.
    pub fn detach_child(&self, parent: &Arc<Inode>, name: &str) -> Result<Arc<Inode>> {
        let id = {
            let mut dir = parent.dir.write().unwrap();
            dir.children
                .remove(name)
                .ok_or_else(|| FsError::not_found(name))?
        };
        let inode = self.require(id)?;
        if inode.kind == InodeKind::Directory {
            let mut meta = parent.meta.write().unwrap();
            meta.nlink = meta.nlink.saturating_sub(1);
        }
        Ok(inode)
    }

    /// Links an existing inode under a (possibly different) parent.
    pub fn attach_child(&self, parent: &Arc<Inode>, name: &str, inode: &Arc<Inode>) -> Result<()> {
        {
            let mut dir = parent.dir.write().unwrap();
            if dir.children.contains_key(name) {
                return Err(FsError::Exists {
                    name: name.to_string(),
                });
            }
            dir.children.insert(name.to_string(), inode.id);
            dir.negative.remove(name);
        }
        if inode.kind == InodeKind::Directory {
            parent.meta.write().unwrap().nlink += 1;
        }
        let mut meta = inode.meta.write().unwrap();
        meta.parent = parent.id;
        meta.name = name.to_string();
        Ok(())
    }

    /// The backend object key of an inode: ancestor names joined by `/`.
    ///
    /// The root's key is the empty string.
    pub fn key_of(&self, ino: InodeId) -> Result<String> {
        let mut components: Vec<String> = Vec::new();
        let mut current = ino;
        while current != ROOT_INODE {
            let inode = self.require(current)?;
            let meta = inode.meta.read().unwrap();
            components.push(meta.name.clone());
            current = meta.parent;
            if components.len() > 4096 {
                return Err(FsError::invalid("inode parent chain too deep"));
            }
        }
        components.reverse();
        Ok(components.join("/"))
    }

    /// Drops `n` kernel lookup references; reclaims the inode when possible.
    pub fn forget(&self, ino: InodeId, n: u64) {
        let inode = match self.get(ino) {
            Some(i) => i,
            None => return,
        };
        {
            let mut meta = inode.meta.write().unwrap();
            meta.lookup_count = meta.lookup_count.saturating_sub(n);
        }
        self.try_reclaim(&inode);
    }

    /// Removes a fully-unreferenced inode from the table and its parent.
    pub fn try_reclaim(&self, inode: &Arc<Inode>) -> bool {
        if inode.id == ROOT_INODE || !inode.reclaimable() {
            return false;
        }
        let (parent_id, name, deleted) = {
            let meta = inode.meta.read().unwrap();
            (
                meta.parent,
                meta.name.clone(),
                meta.state == InodeState::Deleted,
            )
        };
        // deleted inodes left their parent's child map at unlink time
        if !deleted {
            if let Some(parent) = self.get(parent_id) {
                let mut dir = parent.dir.write().unwrap();
                if dir.children.get(&name) == Some(&inode.id) {
                    dir.children.remove(&name);
                }
            }
        }
        self.inodes.write().unwrap().remove(&inode.id);
        debug!("reclaimed inode {}", inode.id);
        true
    }

    /// Ids of all live inodes, for sweeps.
    pub fn all_ids(&self) -> Vec<InodeId> {
        self.inodes.read().unwrap().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> InodeTable {
        InodeTable::new(0, 0)
    }

    #[test]
    fn root_is_prepopulated() {
        let t = table();
        let root = t.get(ROOT_INODE).expect("root exists");
        assert_eq!(root.kind, InodeKind::Directory);
        let meta = root.meta.read().unwrap();
        assert_eq!(meta.nlink, 2);
        assert_eq!(meta.mode, 0o755);
        assert_eq!(meta.lookup_count, 1);
    }

    #[test]
    fn alloc_links_into_parent() {
        let t = table();
        let root = t.get(ROOT_INODE).unwrap();
        let file = t
            .alloc(&root, "a.txt", InodeKind::File, 0o644, 0, 0, InodeState::NewFile)
            .unwrap();

        assert!(file.id > ROOT_INODE);
        let found = t.lookup_child(&root, "a.txt").unwrap();
        assert_eq!(found.id, file.id);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn alloc_directory_bumps_parent_nlink() {
        let t = table();
        let root = t.get(ROOT_INODE).unwrap();
        t.alloc(&root, "d", InodeKind::Directory, 0o755, 0, 0, InodeState::Clean)
            .unwrap();
        assert_eq!(root.meta.read().unwrap().nlink, 3);
    }

    #[test]
    fn alloc_duplicate_name_fails() {
        let t = table();
        let root = t.get(ROOT_INODE).unwrap();
        t.alloc(&root, "x", InodeKind::File, 0o644, 0, 0, InodeState::NewFile)
            .unwrap();
        let err = t
            .alloc(&root, "x", InodeKind::File, 0o644, 0, 0, InodeState::NewFile)
            .unwrap_err();
        assert!(matches!(err, FsError::Exists { .. }));
    }

    #[test]
    fn alloc_rejects_bad_names() {
        let t = table();
        let root = t.get(ROOT_INODE).unwrap();
        for name in ["", ".", "..", "a/b"] {
            let err = t
                .alloc(&root, name, InodeKind::File, 0o644, 0, 0, InodeState::NewFile)
                .unwrap_err();
            assert!(matches!(err, FsError::Invalid { .. }), "name {:?}", name);
        }
    }

    #[test]
    fn alloc_under_file_fails() {
        let t = table();
        let root = t.get(ROOT_INODE).unwrap();
        let file = t
            .alloc(&root, "f", InodeKind::File, 0o644, 0, 0, InodeState::NewFile)
            .unwrap();
        let err = t
            .alloc(&file, "child", InodeKind::File, 0o644, 0, 0, InodeState::NewFile)
            .unwrap_err();
        assert!(matches!(err, FsError::NotDirectory { .. }));
    }

    #[test]
    fn key_of_joins_ancestors() {
        let t = table();
        let root = t.get(ROOT_INODE).unwrap();
        let d = t
            .alloc(&root, "d", InodeKind::Directory, 0o755, 0, 0, InodeState::Clean)
            .unwrap();
        let sub = t
            .alloc(&d, "sub", InodeKind::Directory, 0o755, 0, 0, InodeState::Clean)
            .unwrap();
        let f = t
            .alloc(&sub, "f2", InodeKind::File, 0o644, 0, 0, InodeState::NewFile)
            .unwrap();

        assert_eq!(t.key_of(ROOT_INODE).unwrap(), "");
        assert_eq!(t.key_of(d.id).unwrap(), "d");
        assert_eq!(t.key_of(f.id).unwrap(), "d/sub/f2");
    }

    #[test]
    fn detach_and_attach_move_a_child() {
        let t = table();
        let root = t.get(ROOT_INODE).unwrap();
        let d = t
            .alloc(&root, "d", InodeKind::Directory, 0o755, 0, 0, InodeState::Clean)
            .unwrap();
        let e = t
            .alloc(&root, "e", InodeKind::Directory, 0o755, 0, 0, InodeState::Clean)
            .unwrap();
        let f = t
            .alloc(&d, "f", InodeKind::File, 0o644, 0, 0, InodeState::Clean)
            .unwrap();

        let detached = t.detach_child(&d, "f").unwrap();
        assert_eq!(detached.id, f.id);
        assert!(t.lookup_child(&d, "f").is_none());

        t.attach_child(&e, "renamed", &f).unwrap();
        assert_eq!(t.lookup_child(&e, "renamed").unwrap().id, f.id);
        assert_eq!(t.key_of(f.id).unwrap(), "e/renamed");
    }

    #[test]
    fn child_map_and_parent_fields_stay_consistent() {
        let t = table();
        let root = t.get(ROOT_INODE).unwrap();
        let d = t
            .alloc(&root, "d", InodeKind::Directory, 0o755, 0, 0, InodeState::Clean)
            .unwrap();
        let f = t
            .alloc(&d, "f", InodeKind::File, 0o644, 0, 0, InodeState::Clean)
            .unwrap();

        // every child's parent resolves back through the map
        let dir = d.dir.read().unwrap();
        for (name, id) in dir.children.iter() {
            let child = t.get(*id).unwrap();
            let meta = child.meta.read().unwrap();
            assert_eq!(&meta.name, name);
            assert_eq!(meta.parent, d.id);
        }
        drop(dir);
        assert_eq!(f.meta.read().unwrap().parent, d.id);
    }

    #[test]
    fn forget_reclaims_clean_unreferenced_inode() {
        let t = table();
        let root = t.get(ROOT_INODE).unwrap();
        let f = t
            .alloc(&root, "f", InodeKind::File, 0o644, 0, 0, InodeState::Clean)
            .unwrap();
        let id = f.id;
        drop(f);

        t.forget(id, 1);
        assert!(t.get(id).is_none());
        assert!(t.lookup_child(&root, "f").is_none());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn forget_keeps_open_inode() {
        let t = table();
        let root = t.get(ROOT_INODE).unwrap();
        let f = t
            .alloc(&root, "f", InodeKind::File, 0o644, 0, 0, InodeState::Clean)
            .unwrap();
        f.meta.write().unwrap().open_count = 1;

        t.forget(f.id, 1);
        assert!(t.get(f.id).is_some());
    }

    #[test]
    fn forget_keeps_dirty_inode() {
        let t = table();
        let root = t.get(ROOT_INODE).unwrap();
        let f = t
            .alloc(&root, "f", InodeKind::File, 0o644, 0, 0, InodeState::Modified)
            .unwrap();

        t.forget(f.id, 1);
        // modified inodes must survive until flushed
        assert!(t.get(f.id).is_some());
    }

    #[test]
    fn deleted_inode_survives_until_forgotten() {
        let t = table();
        let root = t.get(ROOT_INODE).unwrap();
        let f = t
            .alloc(&root, "f", InodeKind::File, 0o644, 0, 0, InodeState::Clean)
            .unwrap();

        let detached = t.detach_child(&root, "f").unwrap();
        detached.meta.write().unwrap().state = InodeState::Deleted;

        // gone from the namespace, still addressable by id
        assert!(t.lookup_child(&root, "f").is_none());
        assert!(t.get(f.id).is_some());

        t.forget(f.id, 1);
        assert!(t.get(f.id).is_none());
    }

    #[test]
    fn root_is_never_reclaimed() {
        let t = table();
        t.forget(ROOT_INODE, 100);
        assert!(t.get(ROOT_INODE).is_some());
    }

    #[test]
    fn attr_reflects_meta() {
        let t = table();
        let root = t.get(ROOT_INODE).unwrap();
        let f = t
            .alloc(&root, "f", InodeKind::File, 0o640, 7, 8, InodeState::NewFile)
            .unwrap();
        f.meta.write().unwrap().size = 1025;

        let attr = f.attr();
        assert_eq!(attr.ino, f.id);
        assert_eq!(attr.size, 1025);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.mode, 0o640);
        assert_eq!(attr.uid, 7);
        assert_eq!(attr.gid, 8);
        assert_eq!(attr.kind, InodeKind::File);
    }
}
