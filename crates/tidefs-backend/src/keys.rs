//! Mapping between the hierarchical namespace and the flat key space.
//!
//! An inode's object key is the `/`-joined chain of ancestor names. A
//! directory appears on the backend either implicitly (it is the common
//! prefix of at least one key) or as a marker blob whose key carries a
//! trailing slash.

/// Delimiter used for all key joins.
pub const DELIMITER: char = '/';

/// Joins a parent key and a child name into the child's key.
///
/// The root inode has the empty key, so `join_key("", "a")` is `"a"` and
/// `join_key("a/b", "c")` is `"a/b/c"`.
pub fn join_key(parent_key: &str, name: &str) -> String {
    if parent_key.is_empty() {
        name.to_string()
    } else {
        format!("{}{}{}", parent_key, DELIMITER, name)
    }
}

/// The marker-blob key for a directory key.
pub fn dir_marker_key(key: &str) -> String {
    format!("{}{}", key, DELIMITER)
}

/// Whether a raw backend key is a directory marker.
pub fn is_dir_marker_key(key: &str) -> bool {
    key.ends_with(DELIMITER)
}

/// Strips the marker suffix, returning the directory's logical key.
pub fn strip_dir_marker(key: &str) -> &str {
    key.strip_suffix(DELIMITER).unwrap_or(key)
}

/// Last path component of a key.
pub fn key_name(key: &str) -> &str {
    let key = strip_dir_marker(key);
    key.rsplit(DELIMITER).next().unwrap_or(key)
}

/// Parent key of a key; the root's parent is the empty key.
pub fn parent_key(key: &str) -> &str {
    let key = strip_dir_marker(key);
    match key.rfind(DELIMITER) {
        Some(idx) => &key[..idx],
        None => "",
    }
}

/// The listing prefix that covers a directory's direct children.
pub fn children_prefix(dir_key: &str) -> String {
    if dir_key.is_empty() {
        String::new()
    } else {
        dir_marker_key(dir_key)
    }
}

/// Whether `key` lies strictly under the directory `dir_key`.
pub fn is_under(dir_key: &str, key: &str) -> bool {
    if dir_key.is_empty() {
        return !key.is_empty();
    }
    key.len() > dir_key.len() + 1 && key.starts_with(dir_key) && key.as_bytes()[dir_key.len()] == DELIMITER as u8
}

/// Rewrites a key from one directory prefix to another, for rename.
///
/// Returns `None` when `key` is not under `src_dir`.
pub fn rebase_key(key: &str, src_dir: &str, dst_dir: &str) -> Option<String> {
    if key == src_dir {
        return Some(dst_dir.to_string());
    }
    if !is_under(src_dir, key) {
        return None;
    }
    let tail = if src_dir.is_empty() {
        key
    } else {
        &key[src_dir.len() + 1..]
    };
    Some(join_key(dst_dir, tail))
}

/// Validates a single path component.
///
/// Names must be non-empty, free of the delimiter and NUL, and not the
/// `.`/`..` pseudo-entries the kernel already resolves.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(DELIMITER)
        && !name.contains('\0')
}
