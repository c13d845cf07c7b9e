//! System invariant checks: properties that must hold after any sequence
//! of operations, verified through the public surface.

#[cfg(test)]
mod tests {
    use crate::harness::TestMount;
    use tidefs_backend::keys;
    use tidefs_fs::{InodeKind, OpenFlags, ROOT_INODE};

    #[tokio::test]
    async fn release_leaves_no_dirty_bytes() {
        let m = TestMount::new().await;
        let (_, fh) = m.fs.create(ROOT_INODE, "f", 0o644).await.unwrap();
        m.fs.write(fh, 0, &[5u8; 100]).await.unwrap();
        m.fs.release(fh).await.unwrap();
        m.fs.quiesce().await;

        assert_eq!(m.fs.pool_stats().dirty_bytes, 0);
    }

    #[tokio::test]
    async fn orderly_unmount_backend_equals_graph_key_set() {
        let m = TestMount::new().await;
        let d = m.fs.mkdir(ROOT_INODE, "d", 0o755).await.unwrap();
        let sub = m.fs.mkdir(d.ino, "sub", 0o755).await.unwrap();
        m.put_file(ROOT_INODE, "top", b"1").await;
        m.put_file(d.ino, "mid", b"22").await;
        m.put_file(sub.ino, "leaf", b"333").await;

        m.fs.unmount(false).await.unwrap();

        let mut file_keys: Vec<String> = m
            .backend
            .keys()
            .into_iter()
            .filter(|k| !keys::is_dir_marker_key(k))
            .collect();
        file_keys.sort();
        assert_eq!(
            file_keys,
            vec![
                "d/mid".to_string(),
                "d/sub/leaf".to_string(),
                "top".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn readdir_entries_resolve_back_through_lookup() {
        let m = TestMount::new().await;
        let d = m.fs.mkdir(ROOT_INODE, "dir", 0o755).await.unwrap();
        m.put_file(d.ino, "a", b"1").await;
        m.put_file(d.ino, "b", b"2").await;
        m.fs.symlink(d.ino, "l", "a").await.unwrap();

        for entry in m.fs.readdir(d.ino).await.unwrap() {
            let attr = m.fs.lookup(d.ino, &entry.name).await.unwrap();
            assert_eq!(attr.ino, entry.ino, "entry {} resolves elsewhere", entry.name);
            assert_eq!(attr.kind, entry.kind);
        }
    }

    #[tokio::test]
    async fn write_at_size_grows_and_hole_reads_zero() {
        let m = TestMount::new().await;
        let (attr, fh) = m.fs.create(ROOT_INODE, "g", 0o644).await.unwrap();

        // write exactly at size: growth without a hole
        m.fs.write(fh, 0, b"abc").await.unwrap();
        assert_eq!(m.fs.getattr(attr.ino).unwrap().size, 3);
        m.fs.write(fh, 3, b"def").await.unwrap();
        assert_eq!(m.fs.getattr(attr.ino).unwrap().size, 6);

        // write past size creates a hole reading as zeros
        m.fs.write(fh, 10, b"xy").await.unwrap();
        assert_eq!(m.fs.getattr(attr.ino).unwrap().size, 12);
        let bytes = m.fs.read(fh, 0, 12).await.unwrap();
        assert_eq!(&bytes[..6], b"abcdef");
        assert_eq!(&bytes[6..10], &[0, 0, 0, 0]);
        assert_eq!(&bytes[10..], b"xy");

        m.fs.release(fh).await.unwrap();
    }

    #[tokio::test]
    async fn reads_never_cross_end_of_file() {
        let m = TestMount::new().await;
        let ino = m.put_file(ROOT_INODE, "short", b"12345").await;

        let fh = m.fs.open(ino, OpenFlags::ReadOnly).unwrap();
        assert_eq!(m.fs.read(fh, 3, 100).await.unwrap(), b"45");
        assert!(m.fs.read(fh, 5, 10).await.unwrap().is_empty());
        assert!(m.fs.read(fh, 100, 10).await.unwrap().is_empty());
        m.fs.release(fh).await.unwrap();
    }

    #[tokio::test]
    async fn deleted_entries_never_reappear_in_listings() {
        let m = TestMount::new().await;
        let d = m.fs.mkdir(ROOT_INODE, "d", 0o755).await.unwrap();
        m.put_file(d.ino, "keep", b"1").await;
        m.put_file(d.ino, "drop", b"2").await;

        m.fs.unlink(d.ino, "drop").await.unwrap();
        assert_eq!(m.names_in(d.ino).await, vec!["keep"]);

        // relist from the backend: the unlinked key is gone there too
        m.fs.invalidate_inode(d.ino);
        assert_eq!(m.names_in(d.ino).await, vec!["keep"]);
    }

    #[tokio::test]
    async fn kinds_are_stable_across_rediscovery() {
        let m = TestMount::new().await;
        let d = m.fs.mkdir(ROOT_INODE, "d", 0o755).await.unwrap();
        m.put_file(d.ino, "f", b"x").await;
        m.fs.symlink(d.ino, "l", "f").await.unwrap();

        for entry in m.fs.readdir(d.ino).await.unwrap() {
            match entry.name.as_str() {
                "f" => assert_eq!(entry.kind, InodeKind::File),
                "l" => assert_eq!(entry.kind, InodeKind::Symlink),
                other => panic!("unexpected entry {}", other),
            }
        }
    }

    #[tokio::test]
    async fn pool_accounting_returns_to_zero_after_unlink() {
        let m = TestMount::new().await;
        let (_, fh) = m.fs.create(ROOT_INODE, "tmp", 0o644).await.unwrap();
        m.fs.write(fh, 0, &[9u8; 200]).await.unwrap();
        m.fs.release(fh).await.unwrap();
        m.fs.quiesce().await;

        m.fs.unlink(ROOT_INODE, "tmp").await.unwrap();
        let stats = m.fs.pool_stats();
        assert_eq!(stats.dirty_bytes, 0);
        assert_eq!(stats.resident_bytes, 0);
    }
}
