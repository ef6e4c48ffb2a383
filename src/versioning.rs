//! Versioning cache (C3).
//!
//! A per-`(index, id)` monotonic version counter with compare-and-swap,
//! backing optimistic concurrency for the write pipeline (C5). Write-through
//! in memory only; it is not a system-of-record — cold misses fall back to a
//! point query against the index itself.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

use hashbrown::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VersionEntry {
    pub version: i32,
    pub last_update: DateTime<Utc>,
}

/// Key is `(index name, doc id)`, lowercased on the index component to match
/// the case-insensitive registry convention used elsewhere in the crate.
type Key = (String, String);

/// Concurrent, CAS-backed version cache.
///
/// A single `parking_lot`-guarded map is sufficient here since entries are
/// small and contention is per-key in practice.
#[derive(Default)]
pub struct VersioningCache {
    inner: Mutex<HashMap<Key, VersionEntry>>,
}

fn key(index: &str, id: &str) -> Key {
    (index.to_ascii_lowercase(), id.to_string())
}

impl VersioningCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total: returns `None` if never written, or cleared by a delete.
    pub fn get(&self, index: &str, id: &str) -> Option<VersionEntry> {
        self.inner.lock().get(&key(index, id)).copied()
    }

    /// Inserts a new entry. Returns `false` if an entry already exists.
    pub fn add(&self, index: &str, id: &str, version: i32) -> bool {
        let mut guard = self.inner.lock();
        let k = key(index, id);
        if guard.contains_key(&k) {
            return false;
        }
        guard.insert(
            k,
            VersionEntry {
                version,
                last_update: Utc::now(),
            },
        );
        true
    }

    /// Atomic compare-and-swap: succeeds only if the currently stored
    /// `(version, timestamp)` matches `(expected_version, expected_ts)`.
    pub fn update(
        &self,
        index: &str,
        id: &str,
        expected_version: i32,
        expected_ts: DateTime<Utc>,
        new_version: i32,
    ) -> bool {
        let mut guard = self.inner.lock();
        let k = key(index, id);
        match guard.get(&k) {
            Some(entry) if entry.version == expected_version && entry.last_update == expected_ts => {
                guard.insert(
                    k,
                    VersionEntry {
                        version: new_version,
                        last_update: Utc::now(),
                    },
                );
                true
            }
            _ => false,
        }
    }

    pub fn delete(&self, index: &str, id: &str) {
        self.inner.lock().remove(&key(index, id));
    }

    /// Clears every entry belonging to `index`. Used on index delete.
    pub fn clear_index(&self, index: &str) {
        let prefix = index.to_ascii_lowercase();
        self.inner.lock().retain(|(idx, _), _| idx != &prefix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_add_again_fails() {
        let cache = VersioningCache::new();
        assert!(cache.add("orders", "x", 1));
        assert!(!cache.add("orders", "x", 1));
    }

    #[test]
    fn cas_succeeds_once_loser_gets_version_mismatch() {
        let cache = VersioningCache::new();
        cache.add("orders", "x", 1);
        let entry = cache.get("orders", "x").unwrap();

        let first = cache.update("orders", "x", entry.version, entry.last_update, 2);
        let second = cache.update("orders", "x", entry.version, entry.last_update, 2);

        assert!(first);
        assert!(!second);
        assert_eq!(cache.get("orders", "x").unwrap().version, 2);
    }

    #[test]
    fn delete_clears_entry() {
        let cache = VersioningCache::new();
        cache.add("orders", "x", 1);
        cache.delete("orders", "x");
        assert!(cache.get("orders", "x").is_none());
    }

    #[test]
    fn clear_index_only_drops_matching_index() {
        let cache = VersioningCache::new();
        cache.add("orders", "x", 1);
        cache.add("products", "y", 1);
        cache.clear_index("Orders");
        assert!(cache.get("orders", "x").is_none());
        assert!(cache.get("products", "y").is_some());
    }

    #[test]
    fn index_key_is_case_insensitive() {
        let cache = VersioningCache::new();
        cache.add("Orders", "x", 1);
        assert!(cache.get("orders", "x").is_some());
    }
}
