//! Global buffer-pool accounting, eviction and write back-pressure.
//!
//! The pool does not own buffer bytes; those live in each inode's
//! [`BufferList`](crate::buffer::BufferList). It owns the global numbers: how
//! much memory is resident, how much of it is dirty, which clean pages are
//! eviction candidates, and whether writers must stall until the flusher
//! drains. Callers mutate a buffer list, then report the deltas here.

use std::sync::Mutex;

use lru::LruCache;
use tokio::sync::Notify;
use tracing::debug;

/// Pool counters, for tests and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes currently resident in memory across all buffer lists.
    pub resident_bytes: u64,
    /// Bytes in `Dirty`/`Queued`/`Flushing` buffers.
    pub dirty_bytes: u64,
    /// Clean pages evicted so far.
    pub evictions: u64,
    /// Times a writer stalled on the high watermark.
    pub write_stalls: u64,
}

/// A clean page the pool has chosen to evict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictVictim {
    /// Owning inode.
    pub ino: u64,
    /// Buffer offset within the file.
    pub offset: u64,
    /// Expected bytes freed.
    pub len: u64,
}

struct PoolState {
    resident: u64,
    dirty: u64,
    /// Recently-touched clean pages.
    recent: LruCache<(u64, u64), u64>,
    /// Older generation; evicted first.
    older: LruCache<(u64, u64), u64>,
    stats: PoolStats,
}

/// Memory-budget arbiter shared by every inode.
pub struct BufferPool {
    budget: u64,
    high_watermark: u64,
    low_watermark: u64,
    state: Mutex<PoolState>,
    drained: Notify,
}

impl BufferPool {
    /// Creates a pool with an absolute budget and watermark levels in bytes.
    pub fn new(budget: u64, high_watermark: u64, low_watermark: u64) -> Self {
        Self {
            budget,
            high_watermark,
            low_watermark,
            state: Mutex::new(PoolState {
                resident: 0,
                dirty: 0,
                recent: LruCache::unbounded(),
                older: LruCache::unbounded(),
                stats: PoolStats::default(),
            }),
            drained: Notify::new(),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock().unwrap();
        PoolStats {
            resident_bytes: state.resident,
            dirty_bytes: state.dirty,
            ..state.stats
        }
    }

    /// Configured memory budget.
    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Blocks until the dirty set is below the high watermark.
    ///
    /// This is the write back-pressure point: `acquire_write` callers pass
    /// through here before touching any buffer list.
    pub async fn reserve_write(&self) {
        loop {
            let notified = self.drained.notified();
            {
                let mut state = self.state.lock().unwrap();
                if state.dirty < self.high_watermark {
                    return;
                }
                state.stats.write_stalls += 1;
                debug!(
                    "write stalled: dirty={} high_watermark={}",
                    state.dirty, self.high_watermark
                );
            }
            notified.await;
        }
    }

    /// Reports a change in an inode's resident/dirty byte counts.
    ///
    /// Deltas may be negative (flush completion, truncation, eviction).
    pub fn apply_delta(&self, resident_delta: i64, dirty_delta: i64) {
        let mut state = self.state.lock().unwrap();
        state.resident = add_signed(state.resident, resident_delta);
        state.dirty = add_signed(state.dirty, dirty_delta);
        if dirty_delta < 0 && state.dirty <= self.low_watermark {
            self.drained.notify_waiters();
        }
    }

    /// Records a clean page touch (install or cache-hit read).
    pub fn touch_clean(&self, ino: u64, offset: u64, len: u64) {
        let mut state = self.state.lock().unwrap();
        state.older.pop(&(ino, offset));
        state.recent.put((ino, offset), len);
    }

    /// Forgets a clean page (buffer removed or overwritten).
    pub fn forget_clean(&self, ino: u64, offset: u64) {
        let mut state = self.state.lock().unwrap();
        state.recent.pop(&(ino, offset));
        state.older.pop(&(ino, offset));
    }

    /// Forgets every page of an inode (unlink, reclaim).
    pub fn forget_inode(&self, ino: u64) {
        let mut state = self.state.lock().unwrap();
        let keys: Vec<(u64, u64)> = state
            .recent
            .iter()
            .chain(state.older.iter())
            .map(|(k, _)| *k)
            .filter(|(i, _)| *i == ino)
            .collect();
        for key in keys {
            state.recent.pop(&key);
            state.older.pop(&key);
        }
    }

    /// How many bytes must be evicted to get back under budget, if any.
    pub fn over_budget(&self) -> Option<u64> {
        let state = self.state.lock().unwrap();
        if state.resident > self.budget {
            Some(state.resident - self.budget)
        } else {
            None
        }
    }

    /// Picks clean pages to evict, oldest generation first.
    ///
    /// The chosen entries are removed from the LRU immediately; the caller
    /// drops their bytes from the owning buffer lists and reports the freed
    /// memory through [`apply_delta`](Self::apply_delta). After each pass
    /// the surviving recent generation ages into the older one.
    pub fn evict_victims(&self, target_bytes: u64) -> Vec<EvictVictim> {
        let mut state = self.state.lock().unwrap();
        let mut victims = Vec::new();
        let mut freed = 0u64;

        while freed < target_bytes {
            let entry = state
                .older
                .pop_lru()
                .or_else(|| state.recent.pop_lru());
            match entry {
                Some(((ino, offset), len)) => {
                    freed += len;
                    victims.push(EvictVictim { ino, offset, len });
                }
                None => break,
            }
        }
        state.stats.evictions += victims.len() as u64;

        // age: everything recently touched moves to the older generation
        while let Some((key, len)) = state.recent.pop_lru() {
            state.older.put(key, len);
        }

        debug!(
            "eviction pass: {} victims, {} bytes (target {})",
            victims.len(),
            freed,
            target_bytes
        );
        victims
    }

    /// Clean pages currently tracked, for tests.
    pub fn tracked_clean_pages(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.recent.len() + state.older.len()
    }
}

fn add_signed(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}
