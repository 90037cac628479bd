//! Status propagation.
//!
//! For one event: repair the node's place in the tree if needed, apply the
//! status policy, update the node, then walk up the parent chain recomputing
//! each ancestor from its children. Records go out only on status flips and
//! deletions.

use std::sync::Arc;

use kinwatch_core::owner::resolve_deployment;
use kinwatch_core::{EventType, Indexers, Kind, ObjectKey, Snapshot, Status};
use kinwatch_sender::Sender;
use kinwatch_store::{NodeFields, RelationshipCache, ResourceNode, WorkQueue};
use tracing::{debug, info};

use crate::{HandleError, Reconciler};

const DELETE_REASON: &str = "delete";

/// Whether a parent that loses its last child is inferred deleted.
#[derive(Debug, Clone, Copy)]
pub struct DeletionPolicy {
    pub infer_deployment_deletion: bool,
}

impl Default for DeletionPolicy {
    fn default() -> Self { Self { infer_deployment_deletion: true } }
}

impl DeletionPolicy {
    pub fn infers_deletion(&self, kind: Kind) -> bool {
        match kind {
            Kind::Deployment => self.infer_deployment_deletion,
            Kind::Pod => false,
        }
    }
}

pub struct Handler {
    cache: Arc<RelationshipCache>,
    sender: Arc<Sender>,
    indexers: Indexers,
    policy: DeletionPolicy,
    pod_queue: Option<Arc<WorkQueue<ObjectKey>>>,
}

impl Handler {
    pub fn new(cache: Arc<RelationshipCache>, sender: Arc<Sender>, indexers: Indexers, policy: DeletionPolicy) -> Self {
        Self { cache, sender, indexers, policy, pod_queue: None }
    }

    /// Queue that receives the pods of a Deployment whose node was just
    /// created, so pods seen before their parent get placed without waiting
    /// for their next event.
    pub fn with_pod_queue(mut self, queue: Arc<WorkQueue<ObjectKey>>) -> Self {
        self.pod_queue = Some(queue);
        self
    }

    pub fn cache(&self) -> &Arc<RelationshipCache> { &self.cache }

    /// Give a missing or lone node its place in the tree. `Ok(None)` means
    /// the node cannot be placed yet and the event is dropped; a later event
    /// for the same key retries.
    fn repair(
        &self,
        kind: Kind,
        key: &ObjectKey,
        snap: &Snapshot,
        existing: Option<Arc<ResourceNode>>,
    ) -> Result<Option<Arc<ResourceNode>>, HandleError> {
        let fresh = existing.is_none();
        let node = existing.unwrap_or_else(|| ResourceNode::new(key.clone(), kind, snap.name()));
        let pod = match snap {
            Snapshot::Deployment(_) => {
                let attached = self.cache.attach(Arc::clone(&node));
                if fresh && attached.as_ref().is_some_and(|n| Arc::ptr_eq(n, &node)) {
                    self.requeue_pods_of(key);
                }
                return Ok(attached);
            }
            Snapshot::Pod(pod) => pod,
        };
        let parent_key = match resolve_deployment(pod, &self.indexers)? {
            Ok(k) => k,
            Err(why) => {
                debug!(key = %key, ?why, "pod is an orphan for now");
                return Ok(None);
            }
        };
        let Some(parent) = self.cache.lookup(&parent_key) else {
            debug!(key = %key, parent = %parent_key, "parent not in cache yet");
            return Ok(None);
        };
        if !parent.add_child(&node) {
            debug!(key = %key, parent = %parent_key, "parent is being removed");
            return Ok(None);
        }
        Ok(self.cache.attach(node))
    }

    fn requeue_pods_of(&self, deployment: &ObjectKey) {
        let Some(queue) = &self.pod_queue else { return };
        let mut queued = 0usize;
        for k in self.indexers.pods.keys() {
            if k.namespace() != deployment.namespace() || self.cache.lookup(&k).is_some_and(|n| !n.is_orphan()) {
                continue;
            }
            let Ok(Some(pod)) = self.indexers.pods.get(&k) else { continue };
            if matches!(resolve_deployment(&pod, &self.indexers), Ok(Ok(ref owner)) if owner == deployment) {
                queue.add(k);
                queued += 1;
            }
        }
        if queued > 0 {
            debug!(key = %deployment, pods = queued, "requeued pods of new deployment node");
        }
    }

    /// Apply `status`/`reason` to `node`, then walk up the parent chain
    /// recomputing each ancestor from its children.
    async fn propagate(&self, node: Arc<ResourceNode>, status: Status, reason: String, snapshot: Option<Snapshot>) {
        let mut parent_key = node.parent();
        if node.mutate(|f| apply(&node, f, status, reason, snapshot)) {
            self.settle(&node, status).await;
        }
        while let Some(parent) = parent_key.and_then(|k| self.cache.lookup(&k)) {
            parent_key = parent.parent();
            let Some((status, notify)) = self.deal_up(&parent) else { break };
            if notify {
                self.settle(&parent, status).await;
            }
        }
    }

    /// Recompute `parent` from its children and apply the result in one
    /// critical section. `None` when the parent is gone or inferred deletion
    /// is vetoed for its kind.
    fn deal_up(&self, parent: &ResourceNode) -> Option<(Status, bool)> {
        parent.mutate_with_children(|f, children| {
            if f.status.is_deleted() {
                return None;
            }
            let (status, reason) = self.aggregate(parent, children)?;
            Some((status, apply(parent, f, status, reason, None)))
        })
    }

    /// Candidate `(status, reason)` for `parent` from its children. Runs
    /// under the parent's write lock.
    fn aggregate(&self, parent: &ResourceNode, children: &[Arc<ResourceNode>]) -> Option<(Status, String)> {
        if children.is_empty() {
            if self.policy.infers_deletion(parent.kind()) {
                return Some((Status::Deleted, String::new()));
            }
            debug!(key = %parent.key(), "last child gone; inferred deletion disabled");
            return None;
        }
        let failed: Vec<String> = children.iter().filter(|c| c.status() == Status::Failed).map(|c| c.reason()).collect();
        if failed.is_empty() {
            Some((Status::Succeeded, String::new()))
        } else {
            Some((Status::Failed, failed.join("\n")))
        }
    }

    /// Publish a flip or deletion of `node`; a deleted node leaves the cache
    /// before its record goes out.
    async fn settle(&self, node: &ResourceNode, status: Status) {
        let record = node.record();
        if status.is_deleted() {
            info!(kind = %node.kind(), key = %node.key(), "node deleted");
            self.cache.remove(node);
        }
        if let Err(e) = self.sender.enqueue(record).await {
            debug!(key = %node.key(), error = %e, "record dropped");
        }
    }
}

/// Field update under the node lock. Returns whether a record is due: on a
/// status flip or a deletion, never on a reason-only change.
fn apply(node: &ResourceNode, f: &mut NodeFields, status: Status, reason: String, snapshot: Option<Snapshot>) -> bool {
    // Already removed: a late pass must not revive it.
    if f.status.is_deleted() {
        return false;
    }
    if let Some(s) = snapshot {
        f.snapshot = Some(s);
    }
    if !reason.is_empty() && reason != f.reason {
        debug!(kind = %node.kind(), key = %node.key(), old = %f.reason, new = %reason, "reason changed");
        f.reason = reason.clone();
    }
    let flipped = status != f.status;
    if flipped {
        info!(kind = %node.kind(), key = %node.key(), old = %f.status, new = %status, "status changed");
        f.status = status;
        f.reason = reason;
    }
    flipped || status.is_deleted()
}

#[async_trait::async_trait]
impl Reconciler for Handler {
    async fn reconcile(
        &self,
        kind: Kind,
        event: EventType,
        key: &ObjectKey,
        snapshot: Option<Snapshot>,
    ) -> Result<(), HandleError> {
        if let Some(got) = snapshot.as_ref().map(Snapshot::kind).filter(|got| *got != kind) {
            return Err(HandleError::KindMismatch { kind, got });
        }
        // A deleted node still indexed is on its way out; treat it as absent.
        let existing = self.cache.lookup(key).filter(|n| !n.status().is_deleted());
        let (node, status, reason) = match (event, snapshot.as_ref()) {
            (EventType::Update, Some(snap)) => {
                let node = match existing {
                    Some(n) if !n.is_orphan() => n,
                    other => match self.repair(kind, key, snap, other)? {
                        Some(n) => n,
                        None => return Ok(()),
                    },
                };
                let (status, reason) = snap.status();
                (node, status, reason)
            }
            _ => match existing {
                Some(n) => (n, Status::Deleted, DELETE_REASON.to_string()),
                None => {
                    debug!(kind = %kind, key = %key, "delete for unknown node ignored");
                    return Ok(());
                }
            },
        };
        self.propagate(node, status, reason, snapshot).await;
        Ok(())
    }
}
