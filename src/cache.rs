//! The node address cache: path → current record address, with idle
//! expiry and ancestor lookup. The root path is never cached; its address
//! always comes from the dedicated root pointer in the file header.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::path;
use crate::storage::RecordAddress;
use crate::value::ValueType;

const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(60);

/// Tombstones outlive the delete long enough to keep a racing read from
/// re-populating a stale address.
const TOMBSTONE_TIMEOUT: Duration = Duration::from_secs(2);

/// Sweep the table for dead entries once it crosses this size.
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Entry {
    address: RecordAddress,
    value_type: ValueType,
    removed: bool,
    expires: Instant,
}

#[derive(Debug)]
pub struct NodeAddressCache {
    entries: HashMap<String, Entry>,
    timeout: Duration,
}

impl Default for NodeAddressCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TIMEOUT)
    }
}

impl NodeAddressCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Cached address for a path. A hit refreshes the entry's expiry.
    /// Removed and expired entries are misses.
    pub fn find(&mut self, path: &str) -> Option<(RecordAddress, ValueType)> {
        let now = Instant::now();
        let timeout = self.timeout;
        let entry = self.entries.get_mut(path)?;
        if entry.removed || entry.expires <= now {
            return None;
        }
        entry.expires = now + timeout;
        Some((entry.address, entry.value_type))
    }

    /// Insert or replace from the writer path. Clears any tombstone.
    pub fn update(&mut self, path: &str, address: RecordAddress, value_type: ValueType) {
        if path.is_empty() {
            return;
        }
        self.maybe_sweep();
        self.entries.insert(
            path.to_string(),
            Entry {
                address,
                value_type,
                removed: false,
                expires: Instant::now() + self.timeout,
            },
        );
    }

    /// Insert from a reader. Ignored while a tombstone for the path is
    /// present, so a read racing a delete can't resurrect the address.
    pub fn update_from_read(&mut self, path: &str, address: RecordAddress, value_type: ValueType) {
        if path.is_empty() {
            return;
        }
        if let Some(existing) = self.entries.get(path) {
            if existing.removed && existing.expires > Instant::now() {
                return;
            }
        }
        self.update(path, address, value_type);
    }

    /// Drop the entry for `path` and every cached descendant. With
    /// `mark_deleted`, leave a tombstone behind instead.
    pub fn invalidate(&mut self, path: &str, mark_deleted: bool) {
        let now = Instant::now();
        self.entries.retain(|cached, entry| {
            if cached == path || path::is_ancestor(path, cached) {
                if mark_deleted {
                    entry.removed = true;
                    entry.expires = now + TOMBSTONE_TIMEOUT;
                    true
                } else {
                    false
                }
            } else {
                true
            }
        });
        log::debug!(
            "invalidated \"{}\"{}",
            path,
            if mark_deleted { " (deleted)" } else { "" }
        );
    }

    /// Walk up the parent chain until a live cached entry is found.
    pub fn find_ancestor(&mut self, path: &str) -> Option<(String, RecordAddress, ValueType)> {
        let mut current = path::parent_path(path)?;
        loop {
            if current.is_empty() {
                return None;
            }
            if let Some((addr, vt)) = self.find(&current) {
                return Some((current, addr, vt));
            }
            current = path::parent_path(&current)?;
        }
    }

    fn maybe_sweep(&mut self) {
        if self.entries.len() < SWEEP_THRESHOLD {
            return;
        }
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u32) -> RecordAddress {
        RecordAddress::new(n, 0)
    }

    #[test]
    fn find_and_update() {
        let mut cache = NodeAddressCache::default();
        assert!(cache.find("a/b").is_none());
        cache.update("a/b", addr(1), ValueType::Object);
        assert_eq!(cache.find("a/b"), Some((addr(1), ValueType::Object)));
        // Root is never cached
        cache.update("", addr(9), ValueType::Object);
        assert!(cache.find("").is_none());
    }

    #[test]
    fn invalidate_covers_descendants() {
        let mut cache = NodeAddressCache::default();
        cache.update("a", addr(1), ValueType::Object);
        cache.update("a/b", addr(2), ValueType::Object);
        cache.update("a/b[2]", addr(3), ValueType::String);
        cache.update("ab", addr(4), ValueType::Object);
        cache.invalidate("a", false);
        assert!(cache.find("a").is_none());
        assert!(cache.find("a/b").is_none());
        assert!(cache.find("a/b[2]").is_none());
        // Sibling with a shared prefix survives
        assert_eq!(cache.find("ab"), Some((addr(4), ValueType::Object)));
    }

    #[test]
    fn tombstone_blocks_read_repopulation() {
        let mut cache = NodeAddressCache::default();
        cache.update("a/b", addr(1), ValueType::Object);
        cache.invalidate("a/b", true);
        assert!(cache.find("a/b").is_none());
        cache.update_from_read("a/b", addr(1), ValueType::Object);
        assert!(cache.find("a/b").is_none());
        // A writer-sourced update replaces the tombstone
        cache.update("a/b", addr(2), ValueType::Object);
        assert_eq!(cache.find("a/b"), Some((addr(2), ValueType::Object)));
    }

    #[test]
    fn ancestor_walk() {
        let mut cache = NodeAddressCache::default();
        cache.update("a", addr(1), ValueType::Object);
        let (p, a, _) = cache.find_ancestor("a/b/c/d").unwrap();
        assert_eq!(p, "a");
        assert_eq!(a, addr(1));
        assert!(cache.find_ancestor("x/y").is_none());
    }

    #[test]
    fn idle_expiry() {
        let mut cache = NodeAddressCache::new(Duration::from_millis(0));
        cache.update("a", addr(1), ValueType::Object);
        assert!(cache.find("a").is_none());
    }
}
