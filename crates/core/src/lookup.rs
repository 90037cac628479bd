//! Point-in-time keyed lookup into the external object indexes.

use std::sync::{Arc, PoisonError, RwLock};

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use rustc_hash::FxHashMap;

use crate::{Kind, ObjectKey, Snapshot};

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("index for {kind} unavailable: {reason}")]
    Unavailable { kind: &'static str, reason: String },
}

/// Read access to the latest known object for a key.
pub trait ObjectLookup<K>: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<K>>, LookupError>;

    /// Every key currently held; used for periodic resync.
    fn keys(&self) -> Vec<ObjectKey>;
}

/// In-memory index, useful for embedding without a cluster and in tests.
pub struct MemoryIndex<K> {
    items: RwLock<FxHashMap<ObjectKey, Arc<K>>>,
}

impl<K> Default for MemoryIndex<K> {
    fn default() -> Self { Self { items: RwLock::new(FxHashMap::default()) } }
}

impl<K> MemoryIndex<K> {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, key: ObjectKey, obj: K) {
        self.items.write().unwrap_or_else(PoisonError::into_inner).insert(key, Arc::new(obj));
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner).remove(key)
    }

    pub fn len(&self) -> usize { self.items.read().unwrap_or_else(PoisonError::into_inner).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl<K: Send + Sync> ObjectLookup<K> for MemoryIndex<K> {
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<K>>, LookupError> {
        Ok(self.items.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned())
    }

    fn keys(&self) -> Vec<ObjectKey> {
        self.items.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }
}

/// The three indexes the pipeline reads from. ReplicaSets are only used to
/// bridge pod ownership to deployments.
#[derive(Clone)]
pub struct Indexers {
    pub deployments: Arc<dyn ObjectLookup<Deployment>>,
    pub replica_sets: Arc<dyn ObjectLookup<ReplicaSet>>,
    pub pods: Arc<dyn ObjectLookup<Pod>>,
}

impl Indexers {
    /// Current snapshot for a tracked kind, `None` when the object is gone.
    pub fn snapshot(&self, kind: Kind, key: &ObjectKey) -> Result<Option<Snapshot>, LookupError> {
        Ok(match kind {
            Kind::Deployment => self.deployments.get(key)?.map(Snapshot::Deployment),
            Kind::Pod => self.pods.get(key)?.map(Snapshot::Pod),
        })
    }

    pub fn keys(&self, kind: Kind) -> Vec<ObjectKey> {
        match kind {
            Kind::Deployment => self.deployments.keys(),
            Kind::Pod => self.pods.keys(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
    use k8s_openapi::api::core::v1::Pod;

    fn pod(name: &str) -> Pod {
        serde_json::from_value(serde_json::json!({ "metadata": { "name": name, "namespace": "ns" } })).unwrap()
    }

    #[test]
    fn snapshot_follows_index_contents() {
        let pods = Arc::new(MemoryIndex::new());
        let idx = Indexers {
            deployments: Arc::new(MemoryIndex::<Deployment>::new()),
            replica_sets: Arc::new(MemoryIndex::<ReplicaSet>::new()),
            pods: pods.clone(),
        };
        let key = ObjectKey::new(Some("ns"), "a");
        assert!(idx.snapshot(Kind::Pod, &key).unwrap().is_none());

        pods.insert(key.clone(), pod("a"));
        let snap = idx.snapshot(Kind::Pod, &key).unwrap().unwrap();
        assert_eq!(snap.kind(), Kind::Pod);
        assert_eq!(snap.name(), "a");
        assert_eq!(idx.keys(Kind::Pod), vec![key.clone()]);
        assert!(idx.keys(Kind::Deployment).is_empty());

        pods.remove(&key);
        assert!(idx.snapshot(Kind::Pod, &key).unwrap().is_none());
        assert!(pods.is_empty());
    }
}
