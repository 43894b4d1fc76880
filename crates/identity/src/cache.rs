//! The in-memory mirror of the watched identity collection.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::object::IdentityObject;
use crate::source::WatchEvent;

/// Keyed store of the currently known identity objects.
///
/// Owned by the backend instance (never process-global) so independent
/// mounts in one process get independent caches with deterministic
/// lifecycles. The watch loop is the only writer; readers see whatever the
/// last list/delta left behind.
#[derive(Debug, Default)]
pub struct IdentityCache {
    objects: RwLock<HashMap<String, IdentityObject>>,
}

impl IdentityCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entire contents (list and resync semantics).
    pub async fn replace_all(&self, objects: Vec<IdentityObject>) {
        let mut map = HashMap::with_capacity(objects.len());
        for object in objects {
            map.insert(object.cache_key(), object);
        }
        *self.objects.write().await = map;
    }

    /// Apply one watch delta.
    pub async fn apply(&self, event: WatchEvent) {
        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                self.objects
                    .write()
                    .await
                    .insert(object.cache_key(), object);
            }
            WatchEvent::Deleted(object) => {
                self.objects.write().await.remove(&object.cache_key());
            }
            WatchEvent::Resync(objects) => self.replace_all(objects).await,
        }
    }

    /// Look up one object by `namespace/name` key.
    pub async fn get(&self, key: &str) -> Option<IdentityObject> {
        self.objects.read().await.get(key).cloned()
    }

    /// Snapshot of every cached object.
    pub async fn list(&self) -> Vec<IdentityObject> {
        self.objects.read().await.values().cloned().collect()
    }

    /// Number of cached objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(namespace: &str, name: &str) -> IdentityObject {
        IdentityObject {
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
            annotations: std::collections::BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn apply_add_modify_delete() {
        let cache = IdentityCache::new();

        cache.apply(WatchEvent::Added(object("ns", "a"))).await;
        assert_eq!(cache.len().await, 1);

        let mut updated = object("ns", "a");
        updated
            .annotations
            .insert("k".to_string(), "v".to_string());
        cache.apply(WatchEvent::Modified(updated.clone())).await;
        assert_eq!(cache.get("ns/a").await.unwrap(), updated);

        cache.apply(WatchEvent::Deleted(object("ns", "a"))).await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn resync_replaces_wholesale() {
        let cache = IdentityCache::new();
        cache.apply(WatchEvent::Added(object("ns", "old"))).await;

        cache
            .apply(WatchEvent::Resync(vec![
                object("ns", "a"),
                object("ns", "b"),
            ]))
            .await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get("ns/old").await.is_none());
        assert!(cache.get("ns/a").await.is_some());
    }

    #[tokio::test]
    async fn default_namespace_key() {
        let cache = IdentityCache::new();
        cache
            .apply(WatchEvent::Added(IdentityObject {
                namespace: None,
                name: "worker".to_string(),
                annotations: std::collections::BTreeMap::new(),
            }))
            .await;
        assert!(cache.get("default/worker").await.is_some());
    }
}
