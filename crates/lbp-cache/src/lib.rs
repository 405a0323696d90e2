// SPDX-License-Identifier: MIT OR Apache-2.0
//! Snapshot-refresh key-value cache.
//!
//! [`Cache::get`] consults only the in-memory snapshot, so it is cheap and
//! never blocks on the store. [`Cache::process_tick`] is the only path that
//! talks to the store; it rebuilds a fresh map and swaps it in behind a
//! `RwLock<Arc<..>>`, so a reader in the middle of [`Cache::get`] never
//! observes a partially-built map.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use lbp_core::KvEntry;
use lbp_store::Store;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A tick-refreshed snapshot cache scoped to an optional key prefix.
///
/// An empty `prefix` caches every key in the store.
pub struct Cache {
    store: Arc<dyn Store>,
    prefix: String,
    snapshot: RwLock<Arc<HashMap<String, KvEntry>>>,
}

impl Cache {
    /// Construct a cache over `store`, scoped to `prefix`, starting empty.
    /// Call [`Cache::process_tick`] at least once before relying on
    /// [`Cache::get`] returning anything.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Read `key` from the current snapshot. Never touches the store.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<KvEntry> {
        let snapshot = self.snapshot.read().expect("cache snapshot lock poisoned");
        snapshot.get(key).cloned()
    }

    /// Return a clone of the full current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<HashMap<String, KvEntry>> {
        Arc::clone(&self.snapshot.read().expect("cache snapshot lock poisoned"))
    }

    /// Number of entries in the current snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.read().expect("cache snapshot lock poisoned").len()
    }

    /// Whether the current snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reload the full matching key set from the store and swap it in.
    /// The write lock is held only for the pointer swap, never while
    /// querying the store.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the prefix scan fails. The existing
    /// snapshot is left untouched on failure.
    pub async fn process_tick(&self) -> Result<usize, lbp_store::StoreError> {
        let entries = self.store.list_kv_prefix(&self.prefix).await?;
        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            map.insert(entry.key.clone(), entry);
        }
        let count = map.len();
        let mut guard = self.snapshot.write().expect("cache snapshot lock poisoned");
        *guard = Arc::new(map);
        drop(guard);
        debug!(prefix = %self.prefix, count, "cache snapshot refreshed");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lbp_store::mock::MockStore;

    fn store() -> Arc<dyn Store> {
        Arc::new(MockStore::new())
    }

    #[tokio::test]
    async fn get_returns_none_before_first_tick() {
        let cache = Cache::new(store(), "resolver");
        assert_eq!(cache.get("pool"), None);
    }

    #[tokio::test]
    async fn tick_populates_snapshot_from_store() {
        let s = store();
        s.set_kv("resolver", "pool", serde_json::json!(["backend-a"]))
            .await
            .unwrap();
        let cache = Cache::new(Arc::clone(&s), "resolver");
        cache.process_tick().await.unwrap();
        let entry = cache.get("pool").expect("pool key present after tick");
        assert_eq!(entry.value, serde_json::json!(["backend-a"]));
    }

    #[tokio::test]
    async fn tick_fully_replaces_snapshot_deleted_keys_disappear() {
        let s = store();
        s.set_kv("resolver", "pool", serde_json::json!("a")).await.unwrap();
        let cache = Cache::new(Arc::clone(&s), "resolver");
        cache.process_tick().await.unwrap();
        assert!(cache.get("pool").is_some());

        s.delete_kv("resolver", "pool").await.unwrap();
        cache.process_tick().await.unwrap();
        assert!(cache.get("pool").is_none());
    }

    #[tokio::test]
    async fn empty_prefix_caches_all_keys() {
        let s = store();
        s.set_kv("resolver", "a", serde_json::json!(1)).await.unwrap();
        s.set_kv("botpoller", "b", serde_json::json!(2)).await.unwrap();
        let cache = Cache::new(Arc::clone(&s), "");
        cache.process_tick().await.unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn scoped_prefix_excludes_other_namespaces() {
        let s = store();
        s.set_kv("resolver", "a", serde_json::json!(1)).await.unwrap();
        s.set_kv("botpoller", "b", serde_json::json!(2)).await.unwrap();
        let cache = Cache::new(Arc::clone(&s), "resolver");
        cache.process_tick().await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("a").is_some());
    }

    #[tokio::test]
    async fn concurrent_reads_during_refresh_see_a_consistent_map() {
        let s = store();
        for i in 0..50 {
            s.set_kv("resolver", &format!("k{i}"), serde_json::json!(i))
                .await
                .unwrap();
        }
        let cache = Arc::new(Cache::new(Arc::clone(&s), "resolver"));
        cache.process_tick().await.unwrap();

        let reader_cache = Arc::clone(&cache);
        let reader = tokio::spawn(async move {
            for _ in 0..1000 {
                let snap = reader_cache.snapshot();
                assert!(snap.len() == 50 || snap.len() == 51);
            }
        });

        s.set_kv("resolver", "k50", serde_json::json!(50)).await.unwrap();
        cache.process_tick().await.unwrap();
        reader.await.unwrap();
    }
}
