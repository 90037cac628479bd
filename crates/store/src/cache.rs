//! Relationship cache: a key -> node index plus the parent/child links
//! between nodes.
//!
//! Lock discipline:
//! - the index has its own lock; a node lock may be taken under it, never
//!   the other way round;
//! - every node guards its fields and links with a node-local lock;
//! - when two node locks are held at once it is always parent, then child.
//!
//! A child points at its parent by key only. The index owns node lifetime.

use std::collections::hash_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use kinwatch_core::{Kind, ObjectKey, Snapshot, Status, StatusChangeRecord};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::debug;

/// Mutable per-node fields, handed out under the node lock.
#[derive(Debug, Default)]
pub struct NodeFields {
    pub status: Status,
    pub reason: String,
    pub snapshot: Option<Snapshot>,
}

#[derive(Default)]
struct NodeState {
    fields: NodeFields,
    parent: Option<ObjectKey>,
    children: Vec<Arc<ResourceNode>>,
}

pub struct ResourceNode {
    key: ObjectKey,
    name: String,
    kind: Kind,
    state: RwLock<NodeState>,
}

impl std::fmt::Debug for ResourceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceNode").field("key", &self.key).field("kind", &self.kind).finish_non_exhaustive()
    }
}

impl ResourceNode {
    pub fn new(key: ObjectKey, kind: Kind, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { key, name: name.into(), kind, state: RwLock::new(NodeState::default()) })
    }

    pub fn key(&self) -> &ObjectKey { &self.key }
    pub fn name(&self) -> &str { &self.name }
    pub fn kind(&self) -> Kind { self.kind }

    fn read(&self) -> RwLockReadGuard<'_, NodeState> { self.state.read().unwrap_or_else(PoisonError::into_inner) }
    fn write(&self) -> RwLockWriteGuard<'_, NodeState> { self.state.write().unwrap_or_else(PoisonError::into_inner) }

    pub fn status(&self) -> Status { self.read().fields.status }
    pub fn reason(&self) -> String { self.read().fields.reason.clone() }
    pub fn snapshot(&self) -> Option<Snapshot> { self.read().fields.snapshot.clone() }
    pub fn parent(&self) -> Option<ObjectKey> { self.read().parent.clone() }
    pub fn child_count(&self) -> usize { self.read().children.len() }

    pub fn child_keys(&self) -> Vec<ObjectKey> {
        self.read().children.iter().map(|c| c.key.clone()).collect()
    }

    /// No parent and no children: a lone node that may still need repair.
    pub fn is_orphan(&self) -> bool {
        let st = self.read();
        st.parent.is_none() && st.children.is_empty()
    }

    /// Read-modify-write of the node fields under the node lock.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut NodeFields) -> R) -> R {
        f(&mut self.write().fields)
    }

    /// Read-modify-write of the node fields with the children in view, all
    /// under this node's write lock. Children may be read (their locks are
    /// taken after this one) but not relinked.
    pub fn mutate_with_children<R>(&self, f: impl FnOnce(&mut NodeFields, &[Arc<ResourceNode>]) -> R) -> R {
        let mut st = self.write();
        let NodeState { fields, children, .. } = &mut *st;
        f(fields, children)
    }

    /// Visit children under a shared lock. The visitor must not mutate this
    /// node's links (no add/remove here); collect and act afterwards.
    pub fn for_each_child(&self, mut f: impl FnMut(&ResourceNode)) {
        let st = self.read();
        for child in st.children.iter() {
            f(child);
        }
    }

    /// Append `child` and point it at this node. Refused once this node is
    /// deleted so nothing can attach to a node that is leaving the index.
    pub fn add_child(&self, child: &Arc<ResourceNode>) -> bool {
        if child.key == self.key {
            return false;
        }
        let mut st = self.write();
        if st.fields.status.is_deleted() {
            return false;
        }
        if !st.children.iter().any(|c| c.key == child.key) {
            st.children.push(Arc::clone(child));
        }
        child.write().parent = Some(self.key.clone());
        true
    }

    pub fn remove_child(&self, key: &ObjectKey) {
        self.write().children.retain(|c| &c.key != key);
    }

    /// Snapshot of the node as a notification payload.
    pub fn record(&self) -> StatusChangeRecord {
        let st = self.read();
        StatusChangeRecord {
            key: self.key.clone(),
            kind: self.kind,
            name: self.name.clone(),
            status: st.fields.status,
            reason: st.fields.reason.clone(),
            parent_key: st.parent.clone(),
            snapshot: st.fields.snapshot.clone(),
            observed_at: Utc::now(),
        }
    }

    fn view(&self) -> TreeView {
        let st = self.read();
        TreeView {
            key: self.key.clone(),
            kind: self.kind,
            status: st.fields.status,
            reason: st.fields.reason.clone(),
            children: st.children.iter().map(|c| c.view()).collect(),
        }
    }
}

/// Read-only rendering of a subtree.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TreeView {
    pub key: ObjectKey,
    pub kind: Kind,
    pub status: Status,
    pub reason: String,
    pub children: Vec<TreeView>,
}

/// Index of every known, non-deleted node. Constructed once and shared.
#[derive(Default)]
pub struct RelationshipCache {
    index: RwLock<FxHashMap<ObjectKey, Arc<ResourceNode>>>,
}

impl RelationshipCache {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.index.read().unwrap_or_else(PoisonError::into_inner).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.index.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    pub fn lookup(&self, key: &ObjectKey) -> Option<Arc<ResourceNode>> {
        self.index.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    /// Index `node` unless a live node already holds its key, and return the
    /// node that ends up indexed so there is exactly one per key. A deleted
    /// entry is replaced; a deleted `node` is never indexed.
    pub fn attach(&self, node: Arc<ResourceNode>) -> Option<Arc<ResourceNode>> {
        let mut idx = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if node.status().is_deleted() {
            return None;
        }
        let winner = match idx.entry(node.key.clone()) {
            Entry::Occupied(mut e) => {
                if e.get().status().is_deleted() {
                    debug!(key = %node.key, "replacing deleted node");
                    e.insert(node);
                }
                Arc::clone(e.get())
            }
            Entry::Vacant(e) => Arc::clone(e.insert(node)),
        };
        metrics::gauge!("kinwatch_cache_nodes", idx.len() as f64);
        Some(winner)
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<ResourceNode>> {
        let mut idx = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let removed = idx.remove(key);
        metrics::gauge!("kinwatch_cache_nodes", idx.len() as f64);
        removed
    }

    /// Drop the index entry for `node` only if it is still that node.
    fn evict(&self, node: &ResourceNode) {
        let mut idx = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if idx.get(&node.key).is_some_and(|n| std::ptr::eq(Arc::as_ptr(n), node)) {
            idx.remove(&node.key);
        }
        metrics::gauge!("kinwatch_cache_nodes", idx.len() as f64);
    }

    /// Unlink `node` from its parent and its children, then drop it from the
    /// index unless a replacement already took its key. Children stay
    /// indexed, detached, until repaired or deleted.
    pub fn remove(&self, node: &ResourceNode) {
        let (parent, children) = {
            let mut st = node.write();
            (st.parent.take(), std::mem::take(&mut st.children))
        };
        for child in children.iter() {
            let mut cs = child.write();
            if cs.parent.as_ref() == Some(&node.key) {
                cs.parent = None;
            }
        }
        if let Some(parent) = parent.and_then(|k| self.lookup(&k)) {
            parent.remove_child(&node.key);
        }
        if !children.is_empty() {
            debug!(key = %node.key, detached = children.len(), "children detached from removed node");
        }
        self.evict(node);
    }

    /// Top-level nodes (no parent) with their subtrees, ordered by key.
    pub fn roots(&self) -> Vec<TreeView> {
        let nodes: Vec<Arc<ResourceNode>> =
            self.index.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        let mut out: BTreeMap<ObjectKey, TreeView> = BTreeMap::new();
        for n in nodes.iter().filter(|n| n.parent().is_none()) {
            let mut v = n.view();
            v.children.sort_by(|a, b| a.key.cmp(&b.key));
            out.insert(n.key.clone(), v);
        }
        out.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: &str) -> ObjectKey { ObjectKey::new(Some("ns"), n) }

    fn parent_with(cache: &RelationshipCache, name: &str, kids: &[&str]) -> Arc<ResourceNode> {
        let p = cache.attach(ResourceNode::new(key(name), Kind::Deployment, name)).unwrap();
        for k in kids {
            let c = ResourceNode::new(key(k), Kind::Pod, *k);
            assert!(p.add_child(&c));
            cache.attach(c).unwrap();
        }
        p
    }

    #[test]
    fn attach_keeps_one_node_per_key() {
        let cache = RelationshipCache::new();
        let a = cache.attach(ResourceNode::new(key("web"), Kind::Deployment, "web")).unwrap();
        let b = cache.attach(ResourceNode::new(key("web"), Kind::Deployment, "web")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn attach_replaces_deleted_entry_and_never_indexes_deleted_node() {
        let cache = RelationshipCache::new();
        let old = cache.attach(ResourceNode::new(key("web"), Kind::Deployment, "web")).unwrap();
        old.mutate(|f| f.status = Status::Deleted);
        assert!(cache.attach(Arc::clone(&old)).is_none());

        let fresh = ResourceNode::new(key("web"), Kind::Deployment, "web");
        let got = cache.attach(Arc::clone(&fresh)).unwrap();
        assert!(Arc::ptr_eq(&got, &fresh));

        // The late removal of the old node leaves the replacement alone.
        cache.remove(&old);
        let indexed = cache.lookup(&key("web")).unwrap();
        assert!(Arc::ptr_eq(&indexed, &fresh));
        assert_eq!(indexed.status(), Status::Default);
        let pod = ResourceNode::new(key("web-a"), Kind::Pod, "web-a");
        assert!(indexed.add_child(&pod));
    }

    #[test]
    fn attach_racing_removal_leaves_no_deleted_node() {
        for _ in 0..200 {
            let cache = Arc::new(RelationshipCache::new());
            let node = cache.attach(ResourceNode::new(key("web"), Kind::Deployment, "web")).unwrap();
            let remover = {
                let (cache, node) = (Arc::clone(&cache), Arc::clone(&node));
                std::thread::spawn(move || {
                    node.mutate(|f| f.status = Status::Deleted);
                    cache.remove(&node);
                })
            };
            cache.attach(Arc::clone(&node));
            remover.join().unwrap();
            assert!(cache.lookup(&key("web")).is_none(), "deleted node stayed indexed");
        }
    }

    #[test]
    fn recompute_from_children_is_one_critical_section() {
        let p = ResourceNode::new(key("web"), Kind::Deployment, "web");
        let kids: Vec<_> = ["web-a", "web-b", "web-c"].iter().map(|n| ResourceNode::new(key(n), Kind::Pod, *n)).collect();
        for c in &kids {
            assert!(p.add_child(c));
        }
        let recompute = |p: &ResourceNode| {
            p.mutate_with_children(|f, children| {
                let failed: Vec<String> =
                    children.iter().filter(|c| c.status() == Status::Failed).map(|c| c.reason()).collect();
                f.status = if failed.is_empty() { Status::Succeeded } else { Status::Failed };
                f.reason = failed.join("\n");
            })
        };
        std::thread::scope(|s| {
            for (i, c) in kids.iter().enumerate() {
                let (p, recompute) = (&p, &recompute);
                s.spawn(move || {
                    for round in 0..500 {
                        let failing = (round + i) % 3 == 0;
                        c.mutate(|f| {
                            f.status = if failing { Status::Failed } else { Status::Succeeded };
                            f.reason = if failing { c.name().to_string() } else { String::new() };
                        });
                        recompute(p);
                    }
                });
            }
        });
        let expected: Vec<String> = kids.iter().filter(|c| c.status() == Status::Failed).map(|c| c.reason()).collect();
        assert_eq!(p.status(), if expected.is_empty() { Status::Succeeded } else { Status::Failed });
        assert_eq!(p.reason(), expected.join("\n"));
    }

    #[test]
    fn delete_drops_only_the_index_entry() {
        let cache = RelationshipCache::new();
        let p = parent_with(&cache, "web", &["web-a"]);
        let gone = cache.delete(&key("web")).unwrap();
        assert!(Arc::ptr_eq(&gone, &p));
        assert!(cache.lookup(&key("web")).is_none());
        assert_eq!(p.child_keys(), vec![key("web-a")]);
        assert!(cache.delete(&key("web")).is_none());
    }

    #[test]
    fn add_child_is_deduplicated_and_links_parent() {
        let cache = RelationshipCache::new();
        let p = parent_with(&cache, "web", &["web-a"]);
        let c = cache.lookup(&key("web-a")).unwrap();
        assert!(p.add_child(&c));
        assert_eq!(p.child_keys(), vec![key("web-a")]);
        assert_eq!(c.parent(), Some(key("web")));
        assert!(!c.is_orphan());
        assert!(!p.add_child(&p), "a node cannot own itself");
    }

    #[test]
    fn removing_child_unlinks_from_parent_and_index() {
        let cache = RelationshipCache::new();
        let p = parent_with(&cache, "web", &["web-a", "web-b"]);
        let a = cache.lookup(&key("web-a")).unwrap();
        cache.remove(&a);
        assert_eq!(p.child_keys(), vec![key("web-b")]);
        assert!(cache.lookup(&key("web-a")).is_none());
        assert_eq!(a.parent(), None);
    }

    #[test]
    fn removing_parent_detaches_children() {
        let cache = RelationshipCache::new();
        let p = parent_with(&cache, "web", &["web-a", "web-b"]);
        p.mutate(|f| f.status = Status::Deleted);
        cache.remove(&p);
        assert!(cache.lookup(&key("web")).is_none());
        for k in ["web-a", "web-b"] {
            let c = cache.lookup(&key(k)).unwrap();
            assert_eq!(c.parent(), None);
            assert!(c.is_orphan());
        }
        let late = ResourceNode::new(key("web-c"), Kind::Pod, "web-c");
        assert!(!p.add_child(&late), "deleted parent refuses new children");
    }

    #[test]
    fn for_each_child_sees_current_fields() {
        let cache = RelationshipCache::new();
        let p = parent_with(&cache, "web", &["web-a", "web-b"]);
        cache.lookup(&key("web-b")).unwrap().mutate(|f| {
            f.status = Status::Failed;
            f.reason = "OOMKilled".into();
        });
        let mut failed = Vec::new();
        p.for_each_child(|c| if c.status() == Status::Failed { failed.push(c.reason()) });
        assert_eq!(failed, vec!["OOMKilled".to_string()]);
    }

    #[test]
    fn roots_render_sorted_tree() {
        let cache = RelationshipCache::new();
        parent_with(&cache, "web", &["web-b", "web-a"]);
        parent_with(&cache, "api", &[]);
        let roots = cache.roots();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].key, key("api"));
        assert_eq!(roots[1].children.iter().map(|c| c.key.clone()).collect::<Vec<_>>(), vec![key("web-a"), key("web-b")]);
    }

    #[test]
    fn record_carries_parent_key() {
        let cache = RelationshipCache::new();
        parent_with(&cache, "web", &["web-a"]);
        let rec = cache.lookup(&key("web-a")).unwrap().record();
        assert_eq!(rec.parent_key, Some(key("web")));
        assert_eq!(rec.kind, Kind::Pod);
        assert_eq!(rec.status, Status::Default);
    }
}
