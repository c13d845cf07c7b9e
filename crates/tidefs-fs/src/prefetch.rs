//! Sequential-read detection and adaptive readahead.
//!
//! Two consecutive reads whose offsets are contiguous flip an inode into
//! sequential mode; from then on each read proposes a readahead window
//! starting at the read cursor. The window doubles on every hit up to the
//! configured ceiling and snaps back to the initial size on a seek.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::inode::InodeId;

/// Readahead tunables.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchConfig {
    /// First window handed out when sequential mode engages.
    pub initial_window: u64,
    /// Ceiling the window doubles up to.
    pub max_window: u64,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            initial_window: 128 * 1024,
            max_window: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ReadPattern {
    /// Offset the next sequential read would start at.
    next_expected: u64,
    /// Consecutive contiguous reads observed.
    streak: u32,
    /// Current window size.
    window: u64,
    /// Highest offset already scheduled for prefetch.
    scheduled_to: u64,
}

/// A range the caller should fetch ahead of the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchWindow {
    /// Start offset.
    pub offset: u64,
    /// Length in bytes.
    pub len: u64,
}

/// Per-mount readahead state.
pub struct Prefetcher {
    config: PrefetchConfig,
    patterns: Mutex<HashMap<InodeId, ReadPattern>>,
}

impl Prefetcher {
    /// Creates a prefetcher.
    pub fn new(config: PrefetchConfig) -> Self {
        Self {
            config,
            patterns: Mutex::new(HashMap::new()),
        }
    }

    /// Records a read and proposes a readahead window when warranted.
    ///
    /// `size` clips the window to the file extent. Returns `None` for
    /// random access, at end of file, or while the previous window still
    /// covers the cursor.
    pub fn record_read(&self, ino: InodeId, offset: u64, len: u64, size: u64) -> Option<PrefetchWindow> {
        let mut patterns = self.patterns.lock().unwrap();
        let read_end = offset + len;

        let pattern = patterns.entry(ino).or_insert(ReadPattern {
            next_expected: read_end,
            streak: 1,
            window: self.config.initial_window,
            scheduled_to: read_end,
        });

        if pattern.streak >= 1 && offset == pattern.next_expected {
            pattern.streak += 1;
        } else if offset != pattern.next_expected {
            // seek: reset detection and shrink the window
            pattern.streak = 1;
            pattern.window = self.config.initial_window;
            pattern.scheduled_to = read_end;
        }
        pattern.next_expected = read_end;

        if pattern.streak < 2 {
            return None;
        }

        let start = pattern.scheduled_to.max(read_end);
        if start >= size {
            return None;
        }
        let len = pattern.window.min(size - start);
        if len == 0 {
            return None;
        }
        pattern.scheduled_to = start + len;
        // the window doubles on every hit, up to the ceiling
        pattern.window = (pattern.window * 2).min(self.config.max_window);

        debug!(
            "readahead ino={} start={} len={} next_window={}",
            ino, start, len, pattern.window
        );
        Some(PrefetchWindow { offset: start, len })
    }

    /// Whether the inode is currently in sequential mode.
    pub fn is_sequential(&self, ino: InodeId) -> bool {
        self.patterns
            .lock()
            .unwrap()
            .get(&ino)
            .map(|p| p.streak >= 2)
            .unwrap_or(false)
    }

    /// Drops all state for an inode (release, reclaim).
    pub fn forget(&self, ino: InodeId) {
        self.patterns.lock().unwrap().remove(&ino);
    }

    /// Inodes currently tracked, for tests.
    pub fn tracked(&self) -> usize {
        self.patterns.lock().unwrap().len()
    }
}

impl Default for Prefetcher {
    fn default() -> Self {
        Self::new(PrefetchConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefetcher() -> Prefetcher {
        Prefetcher::new(PrefetchConfig {
            initial_window: 100,
            max_window: 400,
        })
    }

    const SIZE: u64 = 1 << 20;

    #[test]
    fn first_read_never_prefetches() {
        let p = prefetcher();
        assert_eq!(p.record_read(1, 0, 10, SIZE), None);
        assert!(!p.is_sequential(1));
    }

    #[test]
    fn two_contiguous_reads_engage_sequential_mode() {
        let p = prefetcher();
        p.record_read(1, 0, 10, SIZE);
        let window = p.record_read(1, 10, 10, SIZE).unwrap();
        assert!(p.is_sequential(1));
        assert_eq!(window.offset, 20);
        assert_eq!(window.len, 100);
    }

    #[test]
    fn window_doubles_up_to_ceiling() {
        let p = prefetcher();
        p.record_read(1, 0, 10, SIZE);
        let w1 = p.record_read(1, 10, 10, SIZE).unwrap();
        assert_eq!(w1.len, 100);
        let w2 = p.record_read(1, 20, 100, SIZE).unwrap();
        assert_eq!(w2.len, 200);
        let w3 = p.record_read(1, 120, 200, SIZE).unwrap();
        assert_eq!(w3.len, 400);
        // ceiling reached
        let w4 = p.record_read(1, 320, 400, SIZE).unwrap();
        assert_eq!(w4.len, 400);
    }

    #[test]
    fn windows_are_contiguous_without_overlap() {
        let p = prefetcher();
        p.record_read(1, 0, 10, SIZE);
        let w1 = p.record_read(1, 10, 10, SIZE).unwrap();
        let w2 = p.record_read(1, 20, 10, SIZE).unwrap();
        assert_eq!(w2.offset, w1.offset + w1.len);
    }

    #[test]
    fn seek_resets_window_and_detection() {
        let p = prefetcher();
        p.record_read(1, 0, 10, SIZE);
        p.record_read(1, 10, 10, SIZE).unwrap();
        p.record_read(1, 20, 10, SIZE).unwrap();

        // jump far away
        assert_eq!(p.record_read(1, 500_000, 10, SIZE), None);
        assert!(!p.is_sequential(1));

        // sequential again from the new position, window back at initial
        let window = p.record_read(1, 500_010, 10, SIZE).unwrap();
        assert_eq!(window.len, 100);
    }

    #[test]
    fn window_clips_at_file_size() {
        let p = prefetcher();
        p.record_read(1, 0, 10, 40);
        let window = p.record_read(1, 10, 10, 40).unwrap();
        assert_eq!(window.offset, 20);
        assert_eq!(window.len, 20);
    }

    #[test]
    fn no_window_at_end_of_file() {
        let p = prefetcher();
        p.record_read(1, 0, 20, 40);
        assert_eq!(p.record_read(1, 20, 20, 40), None);
    }

    #[test]
    fn inodes_are_tracked_independently() {
        let p = prefetcher();
        p.record_read(1, 0, 10, SIZE);
        p.record_read(2, 1000, 10, SIZE);
        p.record_read(1, 10, 10, SIZE).unwrap();
        assert!(p.is_sequential(1));
        assert!(!p.is_sequential(2));
    }

    #[test]
    fn forget_drops_state() {
        let p = prefetcher();
        p.record_read(1, 0, 10, SIZE);
        p.record_read(1, 10, 10, SIZE).unwrap();
        p.forget(1);
        assert!(!p.is_sequential(1));
        assert_eq!(p.tracked(), 0);
    }
}
