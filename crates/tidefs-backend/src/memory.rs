//! In-memory reference backend.
//!
//! A complete [`StorageBackend`] over a `BTreeMap`, used by the test suites
//! and the local mount mode. Listings are naturally sorted and paginated,
//! ranged gets and `If-Match` behave like S3, and multipart sessions police
//! part numbering and sizes the way real stores do. Failures can be injected
//! per operation to drive the flush/rename failure paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::backend::StorageBackend;
use crate::capabilities::{Capabilities, DirMarkerScheme};
use crate::error::{BackendError, Result};
use crate::types::*;

const DEFAULT_PAGE: usize = 1000;

fn content_etag(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex_lower(&digest[..16])
}

fn multipart_etag(part_etags: &[String]) -> String {
    let mut hasher = Sha256::new();
    for etag in part_etags {
        hasher.update(etag.as_bytes());
    }
    let digest = hasher.finalize();
    format!("{}-{}", hex_lower(&digest[..16]), part_etags.len())
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
    mtime: SystemTime,
    metadata: BlobMetadata,
    storage_class: Option<String>,
}

#[derive(Debug)]
struct UploadSession {
    key: String,
    metadata: BlobMetadata,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
    started: SystemTime,
}

/// Operation counters, mirroring what the store has been asked to do.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackendStats {
    /// `head_blob` calls.
    pub heads: u64,
    /// `list_blobs` calls.
    pub lists: u64,
    /// `get_blob` calls.
    pub gets: u64,
    /// `put_blob` calls.
    pub puts: u64,
    /// `copy_blob` calls.
    pub copies: u64,
    /// Keys deleted (single and batched).
    pub deletes: u64,
    /// `rename_blob` calls.
    pub renames: u64,
    /// Parts uploaded.
    pub parts_added: u64,
    /// Uploads committed.
    pub commits: u64,
    /// Uploads aborted.
    pub aborts: u64,
}

struct Inner {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, UploadSession>,
    failures: HashMap<String, VecDeque<BackendError>>,
    stats: MemoryBackendStats,
}

/// In-memory object store.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    caps: Capabilities,
}

impl MemoryBackend {
    /// Creates an empty store with S3-shaped capabilities.
    pub fn new() -> Self {
        let mut caps = Capabilities::s3_defaults("memory");
        caps.server_rename = false;
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                uploads: HashMap::new(),
                failures: HashMap::new(),
                stats: MemoryBackendStats::default(),
            }),
            caps,
        }
    }

    /// Creates a store with explicit capabilities (tests shrink part sizes).
    pub fn with_capabilities(caps: Capabilities) -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                uploads: HashMap::new(),
                failures: HashMap::new(),
                stats: MemoryBackendStats::default(),
            }),
            caps,
        }
    }

    /// Queues an error returned by the next call of `op`
    /// (`head`, `list`, `get`, `put`, `copy`, `delete`, `rename`,
    /// `mp_begin`, `mp_add`, `mp_copy`, `mp_commit`, `mp_abort`).
    pub fn inject_failure(&self, op: &str, error: BackendError) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(error);
    }

    /// Operation counters so far.
    pub fn stats(&self) -> MemoryBackendStats {
        self.inner.lock().unwrap().stats.clone()
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }

    /// Number of in-flight multipart uploads.
    pub fn upload_count(&self) -> usize {
        self.inner.lock().unwrap().uploads.len()
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().objects.keys().cloned().collect()
    }

    /// Bytes of a stored object, for assertions.
    pub fn object_data(&self, key: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|o| o.data.clone())
    }

    /// Directly seeds an object, bypassing stats.
    pub fn seed_object(&self, key: &str, data: Vec<u8>, metadata: BlobMetadata) {
        let mut inner = self.inner.lock().unwrap();
        let etag = content_etag(&data);
        inner.objects.insert(
            key.to_string(),
            StoredObject {
                data,
                etag,
                mtime: SystemTime::now(),
                metadata,
                storage_class: None,
            },
        );
    }

    fn take_failure(inner: &mut Inner, op: &str) -> Option<BackendError> {
        inner.failures.get_mut(op).and_then(VecDeque::pop_front)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn capabilities(&self) -> Capabilities {
        self.caps.clone()
    }

    async fn head_blob(&self, input: HeadBlobInput) -> Result<HeadBlobOutput> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = Self::take_failure(&mut inner, "head") {
            return Err(err);
        }
        inner.stats.heads += 1;

        let obj = inner
            .objects
            .get(&input.key)
            .ok_or_else(|| BackendError::NotFound {
                key: input.key.clone(),
            })?;

        Ok(HeadBlobOutput {
            is_dir_marker: input.key.ends_with('/'),
            key: input.key,
            size: obj.data.len() as u64,
            etag: obj.etag.clone(),
            mtime: obj.mtime,
            metadata: obj.metadata.clone(),
            storage_class: obj.storage_class.clone(),
        })
    }

    async fn list_blobs(&self, input: ListBlobsInput) -> Result<ListBlobsOutput> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = Self::take_failure(&mut inner, "list") {
            return Err(err);
        }
        inner.stats.lists += 1;

        let prefix = input.prefix.clone().unwrap_or_default();
        let page = if input.max_keys == 0 {
            self.caps.max_list_page.min(DEFAULT_PAGE)
        } else {
            input.max_keys.min(self.caps.max_list_page)
        };

        let mut items = Vec::new();
        let mut prefixes: Vec<String> = Vec::new();
        let mut next_continuation = None;

        for (key, obj) in inner.objects.iter() {
            if !key.starts_with(&prefix) {
                if key.as_str() > prefix.as_str() && !prefix.is_empty() {
                    break;
                }
                continue;
            }
            if let Some(after) = &input.continuation {
                if key.as_str() <= after.as_str() {
                    continue;
                }
            }

            if items.len() + prefixes.len() >= page {
                next_continuation = Some(match prefixes.last() {
                    Some(p) if p.as_str() > items.last().map(|i: &BlobItem| i.key.as_str()).unwrap_or("") => {
                        p.clone()
                    }
                    _ => items.last().map(|i| i.key.clone()).unwrap_or_else(|| key.clone()),
                });
                break;
            }

            if let Some(delim) = &input.delimiter {
                let rest = &key[prefix.len()..];
                if let Some(idx) = rest.find(delim.as_str()) {
                    let common = format!("{}{}", prefix, &rest[..idx + delim.len()]);
                    if prefixes.last() != Some(&common) {
                        prefixes.push(common);
                    }
                    continue;
                }
            }

            items.push(BlobItem {
                key: key.clone(),
                size: obj.data.len() as u64,
                etag: obj.etag.clone(),
                mtime: obj.mtime,
                storage_class: obj.storage_class.clone(),
            });
        }

        debug!(
            "memory list: prefix={:?} items={} prefixes={} truncated={}",
            input.prefix,
            items.len(),
            prefixes.len(),
            next_continuation.is_some()
        );

        Ok(ListBlobsOutput {
            items,
            common_prefixes: prefixes,
            next_continuation,
        })
    }

    async fn get_blob(&self, input: GetBlobInput) -> Result<GetBlobOutput> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = Self::take_failure(&mut inner, "get") {
            return Err(err);
        }
        inner.stats.gets += 1;

        let obj = inner
            .objects
            .get(&input.key)
            .ok_or_else(|| BackendError::NotFound {
                key: input.key.clone(),
            })?;

        if let Some(expected) = &input.if_match {
            if expected != &obj.etag {
                return Err(BackendError::PreconditionFailed {
                    key: input.key,
                    expected: expected.clone(),
                });
            }
        }

        let size = obj.data.len() as u64;
        let data = match input.range {
            Some((offset, len)) => {
                if offset >= size {
                    Vec::new()
                } else {
                    let end = (offset + len).min(size) as usize;
                    obj.data[offset as usize..end].to_vec()
                }
            }
            None => obj.data.clone(),
        };

        Ok(GetBlobOutput {
            data,
            size,
            etag: obj.etag.clone(),
            metadata: obj.metadata.clone(),
        })
    }

    async fn put_blob(&self, input: PutBlobInput) -> Result<PutBlobOutput> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = Self::take_failure(&mut inner, "put") {
            return Err(err);
        }
        if input.data.len() as u64 > self.caps.max_put_size {
            return Err(BackendError::TooLarge {
                key: input.key,
                size: input.data.len() as u64,
                limit: self.caps.max_put_size,
            });
        }
        inner.stats.puts += 1;

        let etag = content_etag(&input.data);
        let mtime = SystemTime::now();
        inner.objects.insert(
            input.key.clone(),
            StoredObject {
                data: input.data,
                etag: etag.clone(),
                mtime,
                metadata: input.metadata,
                storage_class: input.storage_class,
            },
        );
        debug!("memory put: key={} etag={}", input.key, etag);
        Ok(PutBlobOutput { etag, mtime })
    }

    async fn copy_blob(&self, input: CopyBlobInput) -> Result<CopyBlobOutput> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = Self::take_failure(&mut inner, "copy") {
            return Err(err);
        }
        inner.stats.copies += 1;

        let src = inner
            .objects
            .get(&input.src)
            .cloned()
            .ok_or_else(|| BackendError::NotFound {
                key: input.src.clone(),
            })?;

        let dst = StoredObject {
            metadata: input.metadata.unwrap_or_else(|| src.metadata.clone()),
            storage_class: input.storage_class.or_else(|| src.storage_class.clone()),
            mtime: SystemTime::now(),
            // server-side copy preserves the content identity
            etag: src.etag.clone(),
            data: src.data,
        };
        let etag = dst.etag.clone();
        inner.objects.insert(input.dst, dst);
        Ok(CopyBlobOutput { etag })
    }

    async fn delete_blob(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = Self::take_failure(&mut inner, "delete") {
            return Err(err);
        }
        if inner.objects.remove(key).is_none() {
            return Err(BackendError::NotFound {
                key: key.to_string(),
            });
        }
        inner.stats.deletes += 1;
        Ok(())
    }

    async fn delete_blobs(&self, keys: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = Self::take_failure(&mut inner, "delete") {
            return Err(err);
        }
        for key in keys {
            if inner.objects.remove(key).is_some() {
                inner.stats.deletes += 1;
            }
        }
        Ok(())
    }

    async fn rename_blob(&self, input: RenameBlobInput) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = Self::take_failure(&mut inner, "rename") {
            return Err(err);
        }
        if !self.caps.server_rename {
            return Err(BackendError::NotSupported { op: "rename" });
        }
        inner.stats.renames += 1;

        let obj = inner
            .objects
            .remove(&input.src)
            .ok_or_else(|| BackendError::NotFound {
                key: input.src.clone(),
            })?;
        inner.objects.insert(input.dst, obj);
        Ok(())
    }

    async fn multipart_begin(&self, input: MultipartBeginInput) -> Result<MultipartBeginOutput> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = Self::take_failure(&mut inner, "mp_begin") {
            return Err(err);
        }

        let upload_id = Uuid::new_v4().to_string();
        inner.uploads.insert(
            upload_id.clone(),
            UploadSession {
                key: input.key,
                metadata: input.metadata,
                parts: BTreeMap::new(),
                started: SystemTime::now(),
            },
        );
        Ok(MultipartBeginOutput { upload_id })
    }

    async fn multipart_add(&self, input: MultipartAddInput) -> Result<MultipartAddOutput> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = Self::take_failure(&mut inner, "mp_add") {
            return Err(err);
        }
        if input.part_number == 0 || input.part_number > self.caps.max_parts {
            return Err(BackendError::invalid(format!(
                "part number {} out of range",
                input.part_number
            )));
        }
        if input.data.len() as u64 > self.caps.max_part_size {
            return Err(BackendError::TooLarge {
                key: input.key,
                size: input.data.len() as u64,
                limit: self.caps.max_part_size,
            });
        }

        let session = inner
            .uploads
            .get_mut(&input.upload_id)
            .ok_or_else(|| BackendError::NotFound {
                key: input.upload_id.clone(),
            })?;
        if session.key != input.key {
            return Err(BackendError::invalid("upload id does not match key"));
        }

        let etag = content_etag(&input.data);
        session
            .parts
            .insert(input.part_number, (etag.clone(), input.data));
        inner.stats.parts_added += 1;
        Ok(MultipartAddOutput { etag })
    }

    async fn multipart_copy(&self, input: MultipartCopyInput) -> Result<MultipartCopyOutput> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = Self::take_failure(&mut inner, "mp_copy") {
            return Err(err);
        }

        let data = {
            let src = inner
                .objects
                .get(&input.src)
                .ok_or_else(|| BackendError::NotFound {
                    key: input.src.clone(),
                })?;
            let size = src.data.len() as u64;
            if input.src_offset >= size {
                Vec::new()
            } else {
                let end = (input.src_offset + input.len).min(size) as usize;
                src.data[input.src_offset as usize..end].to_vec()
            }
        };

        let session = inner
            .uploads
            .get_mut(&input.upload_id)
            .ok_or_else(|| BackendError::NotFound {
                key: input.upload_id.clone(),
            })?;
        let etag = content_etag(&data);
        session.parts.insert(input.part_number, (etag.clone(), data));
        inner.stats.parts_added += 1;
        Ok(MultipartCopyOutput { etag })
    }

    async fn multipart_commit(&self, input: MultipartCommitInput) -> Result<MultipartCommitOutput> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = Self::take_failure(&mut inner, "mp_commit") {
            return Err(err);
        }

        let session = inner
            .uploads
            .remove(&input.upload_id)
            .ok_or_else(|| BackendError::NotFound {
                key: input.upload_id.clone(),
            })?;

        let mut prev = 0u32;
        let mut etags = Vec::with_capacity(input.parts.len());
        let mut data = Vec::new();
        let last_idx = input.parts.len().saturating_sub(1);
        for (idx, (number, etag)) in input.parts.iter().enumerate() {
            if *number <= prev {
                inner.uploads.insert(input.upload_id.clone(), session);
                return Err(BackendError::invalid("part numbers not monotonic"));
            }
            prev = *number;
            let (stored_etag, part_data) = match session.parts.get(number) {
                Some(p) => p,
                None => {
                    inner.uploads.insert(input.upload_id.clone(), session);
                    return Err(BackendError::invalid(format!("part {} missing", number)));
                }
            };
            if stored_etag != etag {
                inner.uploads.insert(input.upload_id.clone(), session);
                return Err(BackendError::invalid(format!("part {} etag mismatch", number)));
            }
            if idx != last_idx && (part_data.len() as u64) < self.caps.min_part_size {
                let size = part_data.len() as u64;
                inner.uploads.insert(input.upload_id.clone(), session);
                return Err(BackendError::TooLarge {
                    key: input.key,
                    size,
                    limit: self.caps.min_part_size,
                });
            }
            etags.push(etag.clone());
            data.extend_from_slice(part_data);
        }

        let etag = multipart_etag(&etags);
        let mtime = SystemTime::now();
        inner.objects.insert(
            input.key.clone(),
            StoredObject {
                data,
                etag: etag.clone(),
                mtime,
                metadata: session.metadata,
                storage_class: None,
            },
        );
        inner.stats.commits += 1;
        debug!("memory multipart commit: key={} etag={}", input.key, etag);
        Ok(MultipartCommitOutput { etag, mtime })
    }

    async fn multipart_abort(&self, input: MultipartAbortInput) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = Self::take_failure(&mut inner, "mp_abort") {
            return Err(err);
        }
        inner.uploads.remove(&input.upload_id);
        inner.stats.aborts += 1;
        Ok(())
    }

    async fn list_multipart_uploads(&self, prefix: &str) -> Result<Vec<MultipartUploadInfo>> {
        let inner = self.inner.lock().unwrap();
        let mut uploads: Vec<MultipartUploadInfo> = inner
            .uploads
            .iter()
            .filter(|(_, s)| s.key.starts_with(prefix))
            .map(|(id, s)| MultipartUploadInfo {
                key: s.key.clone(),
                upload_id: id.clone(),
                metadata: s.metadata.clone(),
                started: s.started,
            })
            .collect();
        uploads.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(uploads)
    }
}
