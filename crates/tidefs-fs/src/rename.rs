//! Rename over a flat key space.
//!
//! Three tiers, picked per backend capability: a server-side rename call
//! when the store has one; an optional instant rename that annotates the
//! source with a forwarding pointer before the bytes move; and the
//! copy-then-delete fallback. The ordering guarantee holds in every tier:
//! no key is deleted before its copy is confirmed, so a crash mid-rename
//! leaves duplicates at the old prefix but never loses data.
//!
//! Copies are serialised per destination key, which closes the race between
//! two renames targeting the same destination while a server-side copy is
//! still settling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tracing::{debug, warn};

use tidefs_backend::metadata::META_FORWARD;
use tidefs_backend::types::*;
use tidefs_backend::{BackendError, Capabilities, DynBackend, RetryExecutor, ThrottleGates};

use crate::config::RenamePolicy;
use crate::error::{FsError, Result};

/// Executes backend-side renames for one mount.
pub struct RenameEngine {
    backend: DynBackend,
    caps: Capabilities,
    retry: RetryExecutor,
    gates: ThrottleGates,
    policy: RenamePolicy,
    instant: bool,
    dest_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RenameEngine {
    /// Creates an engine bound to one backend.
    pub fn new(
        backend: DynBackend,
        caps: Capabilities,
        retry: RetryExecutor,
        gates: ThrottleGates,
        policy: RenamePolicy,
        instant: bool,
    ) -> Self {
        // non-idempotent copies force destination pre-deletion
        let policy = if policy == RenamePolicy::Overwrite && !caps.idempotent_copy {
            RenamePolicy::PreDelete
        } else {
            policy
        };
        Self {
            backend,
            caps,
            retry,
            gates,
            policy,
            instant,
            dest_locks: Mutex::new(HashMap::new()),
        }
    }

    fn dest_lock(&self, dst: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.dest_locks.lock().unwrap();
        Arc::clone(locks.entry(dst.to_string()).or_default())
    }

    fn release_dest_lock(&self, dst: &str) {
        let mut locks = self.dest_locks.lock().unwrap();
        if let Some(lock) = locks.get(dst) {
            // map entry plus our clone: nobody else is waiting
            if Arc::strong_count(lock) <= 2 {
                locks.remove(dst);
            }
        }
    }

    /// The forwarding pointer stored on a source object, when present.
    pub fn resolve_forward(metadata: &BlobMetadata) -> Option<String> {
        metadata.get(META_FORWARD).cloned()
    }

    /// Renames a single object.
    pub async fn rename_key(&self, src: &str, dst: &str) -> Result<()> {
        let lock = self.dest_lock(dst);
        let _guard = lock.lock().await;

        let result = self.rename_key_locked(src, dst).await;
        drop(_guard);
        self.release_dest_lock(dst);
        result
    }

    async fn rename_key_locked(&self, src: &str, dst: &str) -> Result<()> {
        self.apply_dest_policy(dst).await?;

        if self.caps.server_rename {
            let _permit = self.gates.acquire_small().await;
            let outcome = self
                .retry
                .execute(|| {
                    self.backend.rename_blob(RenameBlobInput {
                        src: src.to_string(),
                        dst: dst.to_string(),
                    })
                })
                .await
                .into_result();
            match outcome {
                Ok(()) => {
                    debug!("server-side rename {} -> {}", src, dst);
                    return Ok(());
                }
                Err(BackendError::NotSupported { .. }) => {
                    // capability lied; fall through to copy + delete
                }
                Err(e) => return Err(e.into()),
            }
        }

        if self.instant {
            self.annotate_forward(src, dst).await?;
        }

        self.copy_key(src, dst).await?;
        self.delete_key(src).await?;
        debug!("copied rename {} -> {}", src, dst);
        Ok(())
    }

    /// Renames every key of a directory subtree.
    ///
    /// `pairs` maps each source key to its destination. All copies must
    /// succeed before any delete is issued; a failed copy aborts the whole
    /// rename with the sources untouched.
    pub async fn rename_tree(&self, pairs: Vec<(String, String)>) -> Result<()> {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for (src, dst) in pairs.clone() {
            let backend = Arc::clone(&self.backend);
            let retry = self.retry.clone();
            let gates = self.gates.clone();
            tasks.spawn(async move {
                let _permit = gates.acquire_bulk().await;
                retry
                    .execute(|| {
                        backend.copy_blob(CopyBlobInput {
                            src: src.clone(),
                            dst: dst.clone(),
                            metadata: None,
                            storage_class: None,
                        })
                    })
                    .await
                    .into_result()?;
                Ok(())
            });
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failure = Some(e),
                Err(e) => {
                    failure = Some(FsError::Io {
                        message: format!("copy task failed: {}", e),
                    })
                }
            }
        }
        if let Some(e) = failure {
            warn!("directory rename aborted before any delete: {}", e);
            return Err(e);
        }

        let sources: Vec<String> = pairs.into_iter().map(|(src, _)| src).collect();
        let _permit = self.gates.acquire_small().await;
        self.retry
            .execute(|| self.backend.delete_blobs(&sources))
            .await
            .into_result()?;
        Ok(())
    }

    async fn apply_dest_policy(&self, dst: &str) -> Result<()> {
        if self.policy == RenamePolicy::Overwrite {
            return Ok(());
        }
        let _permit = self.gates.acquire_small().await;
        let head = self
            .backend
            .head_blob(HeadBlobInput {
                key: dst.to_string(),
            })
            .await;
        match head {
            Ok(_) => match self.policy {
                RenamePolicy::Fail => Err(FsError::Exists {
                    name: dst.to_string(),
                }),
                RenamePolicy::PreDelete => {
                    self.backend.delete_blob(dst).await?;
                    Ok(())
                }
                RenamePolicy::Overwrite => Ok(()),
            },
            Err(BackendError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Annotates the source with a forwarding pointer so readers that race
    /// the byte move resolve to the destination.
    async fn annotate_forward(&self, src: &str, dst: &str) -> Result<()> {
        let _permit = self.gates.acquire_small().await;
        let head = self
            .backend
            .head_blob(HeadBlobInput {
                key: src.to_string(),
            })
            .await?;
        let mut metadata = head.metadata;
        metadata.insert(META_FORWARD.to_string(), dst.to_string());
        self.retry
            .execute(|| {
                self.backend.copy_blob(CopyBlobInput {
                    src: src.to_string(),
                    dst: src.to_string(),
                    metadata: Some(metadata.clone()),
                    storage_class: None,
                })
            })
            .await
            .into_result()?;
        Ok(())
    }

    async fn copy_key(&self, src: &str, dst: &str) -> Result<()> {
        // in instant mode the source carries a forwarding pointer by now;
        // the destination copy must not inherit it
        let metadata = if self.instant {
            let head = self
                .backend
                .head_blob(HeadBlobInput {
                    key: src.to_string(),
                })
                .await?;
            let mut metadata = head.metadata;
            metadata.remove(META_FORWARD);
            Some(metadata)
        } else {
            None
        };

        let _permit = self.gates.acquire_small().await;
        self.retry
            .execute(|| {
                self.backend.copy_blob(CopyBlobInput {
                    src: src.to_string(),
                    dst: dst.to_string(),
                    metadata: metadata.clone(),
                    storage_class: None,
                })
            })
            .await
            .into_result()?;
        Ok(())
    }

    async fn delete_key(&self, src: &str) -> Result<()> {
        let _permit = self.gates.acquire_small().await;
        match self
            .retry
            .execute(|| self.backend.delete_blob(src))
            .await
            .into_result()
        {
            Ok(()) | Err(BackendError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
