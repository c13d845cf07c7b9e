//! Mount configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidefs_backend::{RetryConfig, ThrottleConfig};

/// Tunables for one mounted bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Global buffer-pool memory budget in bytes.
    pub memory_budget: u64,
    /// Fraction of the budget at which new writes block.
    pub high_watermark: f64,
    /// Fraction of the budget at which blocked writes resume.
    pub low_watermark: f64,
    /// Dirty size beyond which a flush switches to multipart.
    pub multipart_threshold: u64,
    /// Target part size for multipart uploads.
    pub part_size: u64,
    /// Concurrent part uploads per flush.
    pub flush_parallelism: usize,
    /// TTL for cached directory listings.
    pub listing_ttl: Duration,
    /// TTL for cached negative lookups.
    pub negative_ttl: Duration,
    /// Initial readahead window in bytes.
    pub readahead_initial: u64,
    /// Readahead ceiling in bytes.
    pub readahead_max: u64,
    /// Preferred size for pages fetched on read.
    pub read_chunk: u64,
    /// Directory for spilled dirty buffers; `None` disables spilling.
    pub spill_dir: Option<PathBuf>,
    /// Upper bound on waiting for flushes at unmount.
    pub unmount_deadline: Duration,
    /// Store mode/uid/gid/mtime in object metadata.
    pub store_attrs: bool,
    /// Use metadata forwarding pointers for instant rename.
    pub instant_rename: bool,
    /// What to do when a rename destination already exists.
    pub rename_policy: RenamePolicy,
    /// Retry policy for backend calls.
    pub retry: RetryConfig,
    /// Parallelism gates for backend traffic.
    pub throttle: ThrottleConfig,
}

/// Behaviour when a rename destination key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenamePolicy {
    /// Overwrite in place; safe when the backend copy is idempotent.
    Overwrite,
    /// Delete the destination before copying; for non-idempotent copies.
    PreDelete,
    /// Refuse with `Exists`.
    Fail,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            memory_budget: 1 << 30,
            high_watermark: 0.9,
            low_watermark: 0.6,
            multipart_threshold: 16 * 1024 * 1024,
            part_size: 8 * 1024 * 1024,
            flush_parallelism: 8,
            listing_ttl: Duration::from_secs(30),
            negative_ttl: Duration::from_secs(5),
            readahead_initial: 128 * 1024,
            readahead_max: 16 * 1024 * 1024,
            read_chunk: 512 * 1024,
            spill_dir: None,
            unmount_deadline: Duration::from_secs(60),
            store_attrs: true,
            instant_rename: false,
            rename_policy: RenamePolicy::Overwrite,
            retry: RetryConfig::default(),
            throttle: ThrottleConfig::default(),
        }
    }
}

impl MountConfig {
    /// A configuration shrunk for tests: tiny budget, tiny parts, no sleeps.
    pub fn small_for_tests() -> Self {
        Self {
            memory_budget: 1 << 20,
            multipart_threshold: 64,
            part_size: 32,
            flush_parallelism: 2,
            listing_ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(300),
            readahead_initial: 64,
            readahead_max: 256,
            read_chunk: 64,
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
                backoff_multiplier: 2.0,
                jitter: false,
            },
            ..Self::default()
        }
    }

    /// Absolute dirty-byte level at which `acquire_write` blocks.
    pub fn high_watermark_bytes(&self) -> u64 {
        (self.memory_budget as f64 * self.high_watermark) as u64
    }

    /// Absolute dirty-byte level at which blocked writers resume.
    pub fn low_watermark_bytes(&self) -> u64 {
        (self.memory_budget as f64 * self.low_watermark) as u64
    }
}
