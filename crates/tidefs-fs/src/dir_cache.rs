//! Directory listing cache: freshness state, page merging, negative entries.
//!
//! Each directory inode carries a [`ListingState`] describing how much of
//! the backend listing has been merged into its child map, and a small
//! negative cache suppressing repeated lookups of names recently proven
//! absent. Page merging turns raw backend listing output into typed child
//! entries, unifying marker blobs and common prefixes into directories.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

use tracing::warn;

use tidefs_backend::keys;
use tidefs_backend::types::ListBlobsOutput;

use crate::inode::InodeKind;

/// How much of a directory's backend listing is reflected locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingState {
    /// Never listed; the child map holds only individually looked-up names.
    Unlisted,
    /// Fully listed at the recorded instant.
    Complete {
        /// When the final page was merged.
        at: Instant,
    },
    /// Partially listed; more pages remain after the continuation token.
    Partial {
        /// Token for the next page.
        continuation: String,
        /// When the last page was merged.
        at: Instant,
    },
    /// Invalidated by a write under the prefix or by TTL expiry.
    Stale {
        /// When the listing was invalidated.
        at: Instant,
    },
}

impl ListingState {
    /// Whether a complete listing is still inside its TTL.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        match self {
            ListingState::Complete { at } => at.elapsed() <= ttl,
            _ => false,
        }
    }

    /// Marks the listing stale (a write happened under the prefix).
    pub fn invalidate(&mut self) {
        *self = ListingState::Stale { at: Instant::now() };
    }
}

/// Negative lookup cache for one directory.
#[derive(Debug, Default)]
pub struct NegativeCache {
    entries: HashMap<String, Instant>,
}

impl NegativeCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `name` was proven absent.
    pub fn insert(&mut self, name: &str) {
        self.entries.insert(name.to_string(), Instant::now());
    }

    /// Whether `name` is still covered by a fresh negative entry.
    pub fn contains(&self, name: &str, ttl: Duration) -> bool {
        self.entries
            .get(name)
            .map(|at| at.elapsed() <= ttl)
            .unwrap_or(false)
    }

    /// Drops a negative entry (the name was created).
    pub fn remove(&mut self, name: &str) {
        self.entries.remove(name);
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached negatives, fresh or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One child discovered by a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    /// Child name (single path component).
    pub name: String,
    /// File or directory.
    pub kind: InodeKind,
    /// Object size; zero for directories.
    pub size: u64,
    /// Backend etag, for files.
    pub etag: Option<String>,
    /// Backend mtime, when reported.
    pub mtime: Option<SystemTime>,
    /// Storage class, when reported.
    pub storage_class: Option<String>,
}

/// Merges one listing page into typed child entries.
///
/// `prefix` is the directory's children prefix (`"d/"`, or `""` at the
/// root). Marker blobs and common prefixes both become directories. When a
/// name is carried both by an object and by a prefix (`foo` and `foo/`),
/// the directory wins and the shadowed file is dropped with a warning.
pub fn merge_page(prefix: &str, page: &ListBlobsOutput) -> Vec<ListingEntry> {
    let mut dirs: HashMap<String, ListingEntry> = HashMap::new();
    let mut files: HashMap<String, ListingEntry> = HashMap::new();

    for common in &page.common_prefixes {
        let name = keys::key_name(common).to_string();
        if name.is_empty() {
            continue;
        }
        dirs.insert(
            name.clone(),
            ListingEntry {
                name,
                kind: InodeKind::Directory,
                size: 0,
                etag: None,
                mtime: None,
                storage_class: None,
            },
        );
    }

    for item in &page.items {
        // the directory's own marker lists under its children prefix
        if item.key == prefix {
            continue;
        }
        let rest = match item.key.strip_prefix(prefix) {
            Some(r) => r,
            None => continue,
        };
        if keys::is_dir_marker_key(&item.key) {
            let name = keys::strip_dir_marker(rest).to_string();
            if name.is_empty() || name.contains(keys::DELIMITER) {
                continue;
            }
            dirs.entry(name.clone()).or_insert(ListingEntry {
                name,
                kind: InodeKind::Directory,
                size: 0,
                etag: None,
                mtime: None,
                storage_class: None,
            });
            continue;
        }
        if rest.contains(keys::DELIMITER) {
            // nested key leaked through (unsorted backend without delimiter
            // support); surface only the first component as a directory
            let name = rest
                .split(keys::DELIMITER)
                .next()
                .unwrap_or_default()
                .to_string();
            if name.is_empty() {
                continue;
            }
            dirs.entry(name.clone()).or_insert(ListingEntry {
                name,
                kind: InodeKind::Directory,
                size: 0,
                etag: None,
                mtime: None,
                storage_class: None,
            });
            continue;
        }
        files.insert(
            rest.to_string(),
            ListingEntry {
                name: rest.to_string(),
                kind: InodeKind::File,
                size: item.size,
                etag: Some(item.etag.clone()),
                mtime: Some(item.mtime),
                storage_class: item.storage_class.clone(),
            },
        );
    }

    let mut entries: Vec<ListingEntry> = Vec::with_capacity(dirs.len() + files.len());
    for (name, file) in files {
        if dirs.contains_key(&name) {
            warn!(
                "object {}{} shadowed by directory {}{}/",
                prefix, name, prefix, name
            );
            continue;
        }
        entries.push(file);
    }
    entries.extend(dirs.into_values());
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;
    use tidefs_backend::types::BlobItem;

    fn item(key: &str, size: u64) -> BlobItem {
        BlobItem {
            key: key.to_string(),
            size,
            etag: format!("etag-{}", key),
            mtime: UNIX_EPOCH,
            storage_class: None,
        }
    }

    fn page(items: Vec<BlobItem>, prefixes: Vec<&str>) -> ListBlobsOutput {
        ListBlobsOutput {
            items,
            common_prefixes: prefixes.into_iter().map(String::from).collect(),
            next_continuation: None,
        }
    }

    #[test]
    fn fresh_complete_listing_within_ttl() {
        let state = ListingState::Complete { at: Instant::now() };
        assert!(state.is_fresh(Duration::from_secs(30)));
    }

    #[test]
    fn unlisted_partial_and_stale_are_never_fresh() {
        let ttl = Duration::from_secs(30);
        assert!(!ListingState::Unlisted.is_fresh(ttl));
        assert!(!ListingState::Partial {
            continuation: "k".to_string(),
            at: Instant::now()
        }
        .is_fresh(ttl));
        assert!(!ListingState::Stale { at: Instant::now() }.is_fresh(ttl));
    }

    #[test]
    fn invalidate_transitions_to_stale() {
        let mut state = ListingState::Complete { at: Instant::now() };
        state.invalidate();
        assert!(matches!(state, ListingState::Stale { .. }));
    }

    #[test]
    fn negative_cache_honours_ttl_and_removal() {
        let mut cache = NegativeCache::new();
        let ttl = Duration::from_secs(60);

        assert!(!cache.contains("missing", ttl));
        cache.insert("missing");
        assert!(cache.contains("missing", ttl));
        // a zero TTL expires instantly
        assert!(!cache.contains("missing", Duration::ZERO));

        cache.remove("missing");
        assert!(!cache.contains("missing", ttl));
    }

    #[test]
    fn merge_separates_files_and_prefix_dirs() {
        let page = page(vec![item("d/f1", 128)], vec!["d/sub/"]);
        let entries = merge_page("d/", &page);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "f1");
        assert_eq!(entries[0].kind, InodeKind::File);
        assert_eq!(entries[0].size, 128);
        assert_eq!(entries[1].name, "sub");
        assert_eq!(entries[1].kind, InodeKind::Directory);
    }

    #[test]
    fn merge_skips_own_marker() {
        let page = page(vec![item("d/", 0), item("d/f1", 5)], vec![]);
        let entries = merge_page("d/", &page);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "f1");
    }

    #[test]
    fn merge_treats_child_marker_as_directory() {
        let page = page(vec![item("d/empty/", 0)], vec![]);
        let entries = merge_page("d/", &page);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "empty");
        assert_eq!(entries[0].kind, InodeKind::Directory);
    }

    #[test]
    fn collision_prefers_directory_and_hides_file() {
        let page = page(vec![item("p/foo", 10)], vec!["p/foo/"]);
        let entries = merge_page("p/", &page);

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "foo");
        assert_eq!(entries[0].kind, InodeKind::Directory);
    }

    #[test]
    fn merge_at_root_uses_empty_prefix() {
        let page = page(vec![item("top.txt", 3)], vec!["docs/"]);
        let entries = merge_page("", &page);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "docs");
        assert_eq!(entries[0].kind, InodeKind::Directory);
        assert_eq!(entries[1].name, "top.txt");
        assert_eq!(entries[1].kind, InodeKind::File);
    }

    #[test]
    fn merge_output_is_sorted_by_name() {
        let page = page(
            vec![item("d/zeta", 1), item("d/alpha", 1), item("d/mid", 1)],
            vec![],
        );
        let entries = merge_page("d/", &page);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn nested_leak_surfaces_first_component_as_dir() {
        let page = page(vec![item("d/deep/leaf", 9)], vec![]);
        let entries = merge_page("d/", &page);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "deep");
        assert_eq!(entries[0].kind, InodeKind::Directory);
    }
}
