//! End-to-end scenarios: whole-mount flows driven through the facade.

#[cfg(test)]
mod tests {
    use crate::harness::{TestCluster, TestMount};
    use std::sync::Arc;
    use tidefs_backend::types::{BlobMetadata, HeadBlobInput};
    use tidefs_backend::{BackendError, StorageBackend};
    use tidefs_cluster::RemoteOp;
    use tidefs_fs::{FsError, OpenFlags, ROOT_INODE};

    #[tokio::test]
    async fn create_write_close_reopen_read() {
        let m = TestMount::new().await;
        let ino = m.put_file(ROOT_INODE, "a.txt", b"hello").await;

        let attr = m.fs.lookup(ROOT_INODE, "a.txt").await.unwrap();
        assert_eq!(attr.ino, ino);

        let fh = m.fs.open(ino, OpenFlags::ReadOnly).unwrap();
        assert_eq!(m.fs.read(fh, 0, 5).await.unwrap(), b"hello");
        m.fs.release(fh).await.unwrap();

        // backend holds exactly one key with an observable etag
        assert_eq!(m.backend.keys(), vec!["a.txt".to_string()]);
        let head = m
            .backend
            .head_blob(HeadBlobInput {
                key: "a.txt".to_string(),
            })
            .await
            .unwrap();
        assert!(!head.etag.is_empty());
    }

    #[tokio::test]
    async fn rename_non_empty_directory_end_to_end() {
        let m = TestMount::new().await;
        let d = m.fs.mkdir(ROOT_INODE, "d", 0o755).await.unwrap();
        let sub = m.fs.mkdir(d.ino, "sub", 0o755).await.unwrap();
        m.put_file(d.ino, "f1", &[0x11; 128]).await;
        m.put_file(sub.ino, "f2", &[0x22; 128]).await;

        m.fs.rename(ROOT_INODE, "d", ROOT_INODE, "e").await.unwrap();

        let e = m.fs.lookup(ROOT_INODE, "e").await.unwrap();
        assert_eq!(m.names_in(e.ino).await, vec!["f1", "sub"]);
        let e_sub = m.fs.lookup(e.ino, "sub").await.unwrap();
        assert_eq!(m.names_in(e_sub.ino).await, vec!["f2"]);

        assert!(m.backend.object_data("d/f1").is_none());
        assert!(m.backend.object_data("d/sub/f2").is_none());
        assert_eq!(m.backend.object_data("e/f1").unwrap(), vec![0x11; 128]);
        assert_eq!(m.backend.object_data("e/sub/f2").unwrap(), vec![0x22; 128]);
    }

    #[tokio::test]
    async fn large_write_triggers_multipart_and_close_blocks_until_commit() {
        let m = TestMount::new().await;
        // 8 parts at the configured 32-byte part size
        let body: Vec<u8> = (0..256u32).map(|i| (i % 251) as u8).collect();

        let (_, fh) = m.fs.create(ROOT_INODE, "big.bin", 0o644).await.unwrap();
        m.fs.write(fh, 0, &body).await.unwrap();
        m.fs.release(fh).await.unwrap();
        m.fs.quiesce().await;

        // close returned only after the commit landed
        assert_eq!(m.backend.object_data("big.bin").unwrap(), body);
        assert!(m.backend.stats().commits >= 1);

        // the object's etag is the multipart shape, not a body digest
        let head = m
            .backend
            .head_blob(HeadBlobInput {
                key: "big.bin".to_string(),
            })
            .await
            .unwrap();
        assert!(head.etag.contains('-'));
    }

    #[tokio::test]
    async fn concurrent_overlapping_writes_serialise() {
        let m = Arc::new(TestMount::new().await);
        let (attr, fh_a) = m.fs.create(ROOT_INODE, "overlap", 0o644).await.unwrap();
        let fh_b = m.open_rw(attr.ino);

        // A fills [0, 16), then B overwrites [8, 24)
        let m_a = Arc::clone(&m);
        let m_b = Arc::clone(&m);
        let task_a = tokio::spawn(async move { m_a.fs.write(fh_a, 0, &[0xAA; 16]).await });
        task_a.await.unwrap().unwrap();
        let task_b = tokio::spawn(async move { m_b.fs.write(fh_b, 8, &[0xBB; 16]).await });
        task_b.await.unwrap().unwrap();

        m.fs.release(fh_a).await.unwrap();
        m.fs.release(fh_b).await.unwrap();

        let stored = m.backend.object_data("overlap").unwrap();
        assert_eq!(&stored[..8], &[0xAA; 8]);
        assert_eq!(&stored[8..24], &[0xBB; 16]);
    }

    #[tokio::test]
    async fn directory_rename_partial_failure_rolls_back() {
        let m = TestMount::new().await;
        let d = m.fs.mkdir(ROOT_INODE, "d", 0o755).await.unwrap();
        m.put_file(d.ino, "f1", b"one").await;
        m.put_file(d.ino, "f2", b"two").await;

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

        // no delete was issued and the source directory is intact
        assert_eq!(m.backend.stats().deletes, 0);
        assert_eq!(m.names_in(d.ino).await, vec!["f1", "f2"]);
        assert_eq!(m.backend.object_data("d/f1").unwrap(), b"one");
        assert_eq!(m.backend.object_data("d/f2").unwrap(), b"two");
    }

    #[tokio::test]
    async fn cluster_ownership_forwarding() {
        let c = TestCluster::new(3).await;
        let ino = c.shared_file("shared.bin", b"........").await;
        let owner = c.owner_node(ino);
        let others: Vec<_> = c.nodes.iter().filter(|n| !n.is_local(ino)).collect();
        assert_eq!(others.len(), 2);

        // concurrent writes from both non-owners serialise through the owner
        let w1 = others[0].submit(RemoteOp::Write {
            ino,
            offset: 0,
            data: b"AAAA".to_vec(),
        });
        let w2 = others[1].submit(RemoteOp::Write {
            ino,
            offset: 4,
            data: b"BBBB".to_vec(),
        });
        let (r1, r2) = tokio::join!(w1, w2);
        r1.unwrap().into_result().unwrap();
        r2.unwrap().into_result().unwrap();

        others[0]
            .submit(RemoteOp::Flush { ino })
            .await
            .unwrap()
            .into_result()
            .unwrap();

        assert_eq!(owner.applied_count(), 3);
        for other in &others {
            assert_eq!(other.applied_count(), 0);
        }
        assert_eq!(c.backend.object_data("shared.bin").unwrap(), b"AAAABBBB");
    }

    #[tokio::test]
    async fn small_write_grows_into_multipart_mid_stream() {
        let m = TestMount::new().await;
        let (_, fh) = m.fs.create(ROOT_INODE, "grow", 0o644).await.unwrap();

        // below the 64-byte threshold first, then well past it
        m.fs.write(fh, 0, &[1u8; 32]).await.unwrap();
        m.fs.write(fh, 32, &[2u8; 96]).await.unwrap();
        m.fs.release(fh).await.unwrap();
        m.fs.quiesce().await;

        let mut expected = vec![1u8; 32];
        expected.extend(vec![2u8; 96]);
        assert_eq!(m.backend.object_data("grow").unwrap(), expected);
        assert!(m.backend.stats().commits >= 1);
    }

    #[tokio::test]
    async fn spill_keeps_data_correct_under_tiny_budget() {
        let dir = tempfile::tempdir().unwrap();
        let m = TestMount::with_spill(dir.path().to_path_buf(), 64).await;

        let body: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
        let (_, fh) = m.fs.create(ROOT_INODE, "spilled", 0o644).await.unwrap();
        m.fs.write(fh, 0, &body).await.unwrap();
        m.fs.release(fh).await.unwrap();
        m.fs.quiesce().await;

        assert_eq!(m.backend.object_data("spilled").unwrap(), body);
    }

    #[tokio::test]
    async fn stale_etag_read_retries_with_fresh_object() {
        let m = TestMount::new().await;
        m.backend
            .seed_object("volatile", b"version-one".to_vec(), BlobMetadata::new());
        let attr = m.fs.lookup(ROOT_INODE, "volatile").await.unwrap();

        // another client replaces the object; our cached etag goes stale
        m.backend
            .seed_object("volatile", b"version-two".to_vec(), BlobMetadata::new());

        let fh = m.fs.open(attr.ino, OpenFlags::ReadOnly).unwrap();
        let bytes = m.fs.read(fh, 0, 11).await.unwrap();
        assert_eq!(bytes, b"version-two");
        m.fs.release(fh).await.unwrap();
    }

    #[tokio::test]
    async fn mkdir_rmdir_round_trip_and_idempotence_shape() {
        let m = TestMount::new().await;
        m.fs.mkdir(ROOT_INODE, "dir", 0o755).await.unwrap();

        // a second mkdir with the same arguments now clashes
        let err = m.fs.mkdir(ROOT_INODE, "dir", 0o755).await.unwrap_err();
        assert!(matches!(err, FsError::Exists { .. }));

        m.fs.rmdir(ROOT_INODE, "dir").await.unwrap();

        // rmdir of the now-absent directory reports NotFound
        let err = m.fs.rmdir(ROOT_INODE, "dir").await.unwrap_err();
        assert!(matches!(err, FsError::NotFound { .. }));
    }

    #[tokio::test]
    async fn double_rename_restores_content() {
        let m = TestMount::new().await;
        m.put_file(ROOT_INODE, "a", b"payload").await;

        m.fs.rename(ROOT_INODE, "a", ROOT_INODE, "b").await.unwrap();
        m.fs.rename(ROOT_INODE, "b", ROOT_INODE, "a").await.unwrap();

        let attr = m.fs.lookup(ROOT_INODE, "a").await.unwrap();
        assert_eq!(m.read_file(attr.ino).await, b"payload");
        assert!(m.backend.object_data("b").is_none());
    }

    #[tokio::test]
    async fn listing_prefix_matching_file_key_is_not_a_directory() {
        let m = TestMount::new().await;
        m.put_file(ROOT_INODE, "report", b"data").await;

        // "report" resolves as the file itself, not a spurious directory
        let attr = m.fs.lookup(ROOT_INODE, "report").await.unwrap();
        assert_eq!(attr.kind, tidefs_fs::InodeKind::File);
        assert_eq!(attr.size, 4);
    }
}
