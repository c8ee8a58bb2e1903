use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, PoisonError, RwLock};

/// Ordered string key-value store. Ordering matters: c-list sweeps and
/// `vatstoreGetAfter` walk keys lexicographically.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn delete(&self, key: &str);

    /// Smallest key strictly greater than `previous`.
    fn next_key(&self, previous: &str) -> Option<String>;

    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys = Vec::new();
        if self.has(prefix) {
            keys.push(prefix.to_string());
        }
        let mut cursor = prefix.to_string();
        while let Some(key) = self.next_key(&cursor) {
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.clone());
            cursor = key;
        }
        keys
    }
}

#[derive(Clone, Default)]
pub struct MemKvStore {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl std::fmt::Debug for MemKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemKvStore")
            .field("entries", &self.read().len())
            .finish()
    }
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry, in key order.
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, String>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, String>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KvStore for MemKvStore {
    fn get(&self, key: &str) -> Option<String> {
        self.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.write().insert(key.to_string(), value.to_string());
    }

    fn delete(&self, key: &str) {
        self.write().remove(key);
    }

    fn next_key(&self, previous: &str) -> Option<String> {
        self.read()
            .range::<str, _>((Bound::Excluded(previous), Bound::Unbounded))
            .next()
            .map(|(key, _)| key.clone())
    }

    fn has(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let kv = MemKvStore::new();
        assert_eq!(kv.get("a"), None);
        kv.set("a", "1");
        assert_eq!(kv.get("a").as_deref(), Some("1"));
        assert!(kv.has("a"));
        kv.delete("a");
        assert!(!kv.has("a"));
    }

    #[test]
    fn next_key_and_prefix_scan() {
        let kv = MemKvStore::new();
        for key in ["v1.c.ko1", "v1.c.o+0", "v1.vs.a", "v2.c.ko1", "v1.c."] {
            kv.set(key, "x");
        }
        assert_eq!(kv.next_key("v1.c.ko1").as_deref(), Some("v1.c.o+0"));
        assert_eq!(
            kv.keys_with_prefix("v1.c."),
            vec!["v1.c.", "v1.c.ko1", "v1.c.o+0"]
        );
        assert!(kv.keys_with_prefix("v3.").is_empty());
        assert_eq!(kv.next_key("zzz"), None);
    }

    #[test]
    fn clones_share_state() {
        let kv = MemKvStore::new();
        let other = kv.clone();
        other.set("k", "v");
        assert_eq!(kv.dump().len(), 1);
    }
}
