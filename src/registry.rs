//! Generic case-insensitive concurrent registry (§9 design notes).
//!
//! Both process-scope registries described in §3 (`indexRegistration`,
//! `indexStatus`) are instances of this one abstraction so tests can
//! construct and isolate state without touching process-wide statics.

use ahash::RandomState;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub struct Registry<V> {
    inner: RwLock<HashMap<String, V, RandomState>>,
}

impl<V: Clone> Default for Registry<V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::default()),
        }
    }
}

fn norm(key: &str) -> String {
    key.to_ascii_lowercase()
}

impl<V: Clone> Registry<V> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.read().get(&norm(key)).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().contains_key(&norm(key))
    }

    /// Atomic insert: returns `false` (and does not overwrite) if the key is
    /// already present.
    pub fn insert_new(&self, key: &str, value: V) -> bool {
        let mut guard = self.inner.write();
        let k = norm(key);
        if guard.contains_key(&k) {
            return false;
        }
        guard.insert(k, value);
        true
    }

    /// Unconditional insert/replace.
    pub fn put(&self, key: &str, value: V) {
        self.inner.write().insert(norm(key), value);
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.inner.write().remove(&norm(key))
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_are_case_insensitive() {
        let reg: Registry<i32> = Registry::default();
        reg.put("Orders", 1);
        assert_eq!(reg.get("orders"), Some(1));
        assert_eq!(reg.get("ORDERS"), Some(1));
    }

    #[test]
    fn insert_new_rejects_duplicate_key() {
        let reg: Registry<i32> = Registry::default();
        assert!(reg.insert_new("orders", 1));
        assert!(!reg.insert_new("Orders", 2));
        assert_eq!(reg.get("orders"), Some(1));
    }
}
