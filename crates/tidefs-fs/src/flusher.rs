//! The dirty-buffer flusher.
//!
//! One flusher run owns an inode end to end: it completes the cached body
//! (read-modify-write against the remote object where local coverage has
//! gaps), fences the buffer list, and realises the bytes as either a single
//! PUT or a multipart upload with bounded-parallel part adds. Transient
//! backend errors retry with backoff inside each call; a permanent failure
//! returns the buffers to dirty, records a sticky error on the inode and
//! surfaces on the next operation that touches it.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use tidefs_backend::metadata::{attr_metadata, META_FLUSH_OWNER};
use tidefs_backend::types::*;
use tidefs_backend::{Capabilities, DynBackend, RetryExecutor, ThrottleGates};

use crate::config::MountConfig;
use crate::error::{FsError, Result};
use crate::inode::{Inode, InodeState, InodeTable};
use crate::multipart::{plan_parts, MultipartUpload};
use crate::pool::BufferPool;

/// Drives flushes for every file inode of a mount.
pub struct Flusher {
    backend: DynBackend,
    caps: Capabilities,
    gates: ThrottleGates,
    retry: RetryExecutor,
    pool: Arc<BufferPool>,
    config: MountConfig,
}

impl Flusher {
    /// Creates a flusher bound to one backend and pool.
    pub fn new(
        backend: DynBackend,
        caps: Capabilities,
        gates: ThrottleGates,
        retry: RetryExecutor,
        pool: Arc<BufferPool>,
        config: MountConfig,
    ) -> Self {
        Self {
            backend,
            caps,
            gates,
            retry,
            pool,
            config,
        }
    }

    /// Flushes an inode until its buffer set is clean.
    ///
    /// Blocks while another run owns the inode (at most one flusher per
    /// inode), then loops because writes landing behind the fence leave
    /// fresh dirty buffers that still owe a flush.
    pub async fn flush_inode(&self, table: &InodeTable, inode: &Arc<Inode>) -> Result<()> {
        loop {
            if !self.acquire_run(inode).await? {
                return Ok(());
            }
            let result = self.run_once(table, inode).await;
            self.finish_run(inode, &result);
            result?;

            let has_dirty = inode.file.lock().unwrap().buffers.has_dirty();
            if !has_dirty {
                return Ok(());
            }
        }
    }

    /// Claims flush ownership; `Ok(false)` means nothing to flush.
    async fn acquire_run(&self, inode: &Arc<Inode>) -> Result<bool> {
        loop {
            let notified = inode.flush_done.notified();
            {
                let state = inode.meta.read().unwrap().state.clone();
                if state == InodeState::Deleted {
                    return Ok(false);
                }
                let needs_meta_flush =
                    matches!(state, InodeState::NewFile | InodeState::Modified);

                let mut file = inode.file.lock().unwrap();
                if let Some(message) = &file.sticky_error {
                    return Err(FsError::Io {
                        message: message.clone(),
                    });
                }
                if !file.buffers.has_dirty() && !needs_meta_flush {
                    return Ok(false);
                }
                if !file.flushing {
                    file.flushing = true;
                    return Ok(true);
                }
            }
            notified.await;
        }
    }

    fn finish_run(&self, inode: &Arc<Inode>, result: &Result<()>) {
        {
            let mut file = inode.file.lock().unwrap();
            file.flushing = false;
            file.upload = None;
            if let Err(e) = result {
                file.sticky_error = Some(e.to_string());
            }
        }
        inode.flush_done.notify_waiters();
    }

    async fn run_once(&self, table: &InodeTable, inode: &Arc<Inode>) -> Result<()> {
        let key = table.key_of(inode.id)?;
        let (size, state, mode, uid, gid, mtime, etag, remote_size) = {
            let meta = inode.meta.read().unwrap();
            (
                meta.size,
                meta.state.clone(),
                meta.mode,
                meta.uid,
                meta.gid,
                meta.mtime,
                meta.etag.clone(),
                meta.remote_size,
            )
        };

        let mut metadata = if self.config.store_attrs {
            attr_metadata(mode, uid, gid, mtime)
        } else {
            BlobMetadata::new()
        };

        // metadata-only change on an already-uploaded object: rewrite the
        // object metadata server-side instead of re-sending the body. A
        // size mismatch (truncate/extend) always rewrites the body.
        let dirty = inode.file.lock().unwrap().buffers.has_dirty();
        if !dirty
            && state == InodeState::Modified
            && etag.is_some()
            && remote_size == Some(size)
            && self.caps.server_copy
        {
            return self.rewrite_metadata(inode, &key, metadata).await;
        }

        self.ensure_coverage(inode, &key, size, &state).await?;

        let (fence, body) = {
            let mut file = inode.file.lock().unwrap();
            let fence = file.buffers.begin_flush();
            let body = file
                .buffers
                .assemble(size)?
                .ok_or_else(|| FsError::invalid("buffer coverage lost during flush"))?;
            (fence, body)
        };

        let upload_result = if (body.len() as u64) < self.config.multipart_threshold {
            self.flush_small(&key, body, metadata).await
        } else {
            metadata.insert(META_FLUSH_OWNER.to_string(), "tidefs".to_string());
            self.flush_multipart(inode, &key, body, metadata).await
        };

        match upload_result {
            Ok((new_etag, mtime)) => {
                {
                    let mut meta = inode.meta.write().unwrap();
                    meta.etag = Some(new_etag);
                    meta.mtime = mtime;
                    meta.remote_size = Some(size);
                    if matches!(meta.state, InodeState::NewFile | InodeState::Modified) {
                        meta.state = InodeState::Clean;
                    }
                }
                // the delta spans the settle transition only, so writes that
                // landed during the upload are not counted twice
                let (acc_delta, clean_pages) = {
                    let mut file = inode.file.lock().unwrap();
                    let before = file.buffers.accountable_bytes();
                    file.buffers.end_flush(fence, true);
                    (
                        file.buffers.accountable_bytes() as i64 - before as i64,
                        file.buffers.clean_resident(),
                    )
                };
                self.pool.apply_delta(0, acc_delta);
                for (offset, len) in clean_pages {
                    self.pool.touch_clean(inode.id, offset, len);
                }
                debug!("flushed inode {} key={}", inode.id, key);
                Ok(())
            }
            Err(e) => {
                let acc_delta = {
                    let mut file = inode.file.lock().unwrap();
                    let before = file.buffers.accountable_bytes();
                    file.buffers.end_flush(fence, false);
                    file.buffers.accountable_bytes() as i64 - before as i64
                };
                self.pool.apply_delta(0, acc_delta);
                warn!("flush failed for inode {} key={}: {}", inode.id, key, e);
                Err(e)
            }
        }
    }

    /// Fetches or zero-fills every uncached range so the body assembles.
    async fn ensure_coverage(
        &self,
        inode: &Arc<Inode>,
        key: &str,
        size: u64,
        state: &InodeState,
    ) -> Result<()> {
        loop {
            let missing = {
                let file = inode.file.lock().unwrap();
                file.buffers.missing_ranges(0, size, size)
            };
            if missing.is_empty() {
                return Ok(());
            }
            for (offset, len) in missing {
                if *state == InodeState::NewFile {
                    // nothing exists remotely; uncovered ranges are holes
                    let mut file = inode.file.lock().unwrap();
                    file.buffers.zero_fill(offset, offset + len);
                    continue;
                }
                let _permit = self.gates.acquire_bulk().await;
                let out = self
                    .retry
                    .execute(|| {
                        self.backend.get_blob(GetBlobInput {
                            key: key.to_string(),
                            range: Some((offset, len)),
                            if_match: None,
                        })
                    })
                    .await
                    .into_result()?;
                let installed = {
                    let mut file = inode.file.lock().unwrap();
                    let before = file.buffers.resident_bytes();
                    if (out.data.len() as u64) < len {
                        // the remote object is shorter than our logical size
                        file.buffers
                            .zero_fill(offset + out.data.len() as u64, offset + len);
                    }
                    file.buffers.install_clean(offset, &out.data);
                    file.buffers.resident_bytes() - before
                };
                self.pool.apply_delta(installed as i64, 0);
            }
        }
    }

    async fn rewrite_metadata(
        &self,
        inode: &Arc<Inode>,
        key: &str,
        metadata: BlobMetadata,
    ) -> Result<()> {
        let _permit = self.gates.acquire_small().await;
        let out = self
            .retry
            .execute(|| {
                self.backend.copy_blob(CopyBlobInput {
                    src: key.to_string(),
                    dst: key.to_string(),
                    metadata: Some(metadata.clone()),
                    storage_class: None,
                })
            })
            .await
            .into_result()?;
        let mut meta = inode.meta.write().unwrap();
        meta.etag = Some(out.etag);
        if meta.state == InodeState::Modified {
            meta.state = InodeState::Clean;
        }
        debug!("rewrote metadata for {}", key);
        Ok(())
    }

    async fn flush_small(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: BlobMetadata,
    ) -> Result<(String, std::time::SystemTime)> {
        let _permit = self.gates.acquire_small().await;
        let out = self
            .retry
            .execute(|| {
                self.backend.put_blob(PutBlobInput {
                    key: key.to_string(),
                    data: body.clone(),
                    metadata: metadata.clone(),
                    content_type: None,
                    storage_class: None,
                })
            })
            .await
            .into_result()?;
        Ok((out.etag, out.mtime))
    }

    async fn flush_multipart(
        &self,
        inode: &Arc<Inode>,
        key: &str,
        body: Vec<u8>,
        metadata: BlobMetadata,
    ) -> Result<(String, std::time::SystemTime)> {
        let begin = {
            let _permit = self.gates.acquire_small().await;
            self.retry
                .execute(|| {
                    self.backend.multipart_begin(MultipartBeginInput {
                        key: key.to_string(),
                        metadata: metadata.clone(),
                        content_type: None,
                    })
                })
                .await
                .into_result()?
        };

        let mut upload =
            MultipartUpload::new(begin.upload_id.clone(), key.to_string(), metadata);
        let ranges = plan_parts(
            body.len() as u64,
            self.caps.clamp_part_size(self.config.part_size),
            self.caps.min_part_size,
            self.caps.max_part_size,
        );

        let body = Arc::new(body);
        let mut tasks: JoinSet<Result<(u32, String)>> = JoinSet::new();
        for range in &ranges {
            let part_number = upload.assign_part();
            {
                let mut file = inode.file.lock().unwrap();
                file.buffers.assign_part(range.offset, part_number);
            }
            let backend = Arc::clone(&self.backend);
            let gates = self.gates.clone();
            let retry = self.retry.clone();
            let body = Arc::clone(&body);
            let key = key.to_string();
            let upload_id = begin.upload_id.clone();
            let offset = range.offset as usize;
            let len = range.len as usize;
            tasks.spawn(async move {
                let _permit = gates.acquire_bulk().await;
                let out = retry
                    .execute(|| {
                        backend.multipart_add(MultipartAddInput {
                            key: key.clone(),
                            upload_id: upload_id.clone(),
                            part_number,
                            data: body[offset..offset + len].to_vec(),
                        })
                    })
                    .await
                    .into_result()?;
                Ok((part_number, out.etag))
            });
        }

        let mut failure: Option<FsError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((number, etag))) => {
                    upload.record_part(number, etag)?;
                }
                Ok(Err(e)) => failure = Some(e),
                Err(e) => {
                    failure = Some(FsError::Io {
                        message: format!("part upload task failed: {}", e),
                    })
                }
            }
        }

        if let Some(e) = failure {
            self.abort_upload(key, &begin.upload_id).await;
            return Err(e);
        }

        // expose the in-flight upload on the inode while committing
        {
            let mut file = inode.file.lock().unwrap();
            file.upload = Some(upload);
        }
        let parts = {
            let file = inode.file.lock().unwrap();
            file.upload
                .as_ref()
                .expect("upload just installed")
                .commit_parts()?
        };

        let commit = {
            let _permit = self.gates.acquire_small().await;
            self.retry
                .execute(|| {
                    self.backend.multipart_commit(MultipartCommitInput {
                        key: key.to_string(),
                        upload_id: begin.upload_id.clone(),
                        parts: parts.clone(),
                    })
                })
                .await
                .into_result()
        };
        match commit {
            Ok(out) => Ok((out.etag, out.mtime)),
            Err(e) => {
                self.abort_upload(key, &begin.upload_id).await;
                Err(e.into())
            }
        }
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) {
        let _permit = self.gates.acquire_small().await;
        let result = self
            .backend
            .multipart_abort(MultipartAbortInput {
                key: key.to_string(),
                upload_id: upload_id.to_string(),
            })
            .await;
        if let Err(e) = result {
            warn!("abort of upload {} failed: {}", upload_id, e);
        }
    }

    /// Startup sweep: aborts in-progress uploads stamped with our marker.
    ///
    /// Uploads from other clients (no marker) are left for the backend's
    /// lifecycle policy.
    pub async fn sweep_stale_uploads(&self) -> Result<usize> {
        let uploads = self.backend.list_multipart_uploads("").await?;
        let mut aborted = 0;
        for info in uploads {
            if info.metadata.contains_key(META_FLUSH_OWNER) {
                self.abort_upload(&info.key, &info.upload_id).await;
                aborted += 1;
            }
        }
        if aborted > 0 {
            debug!("aborted {} stale multipart uploads", aborted);
        }
        Ok(aborted)
    }
}
