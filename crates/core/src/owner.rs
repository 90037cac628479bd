//! Pod ownership resolution: Pod -> ReplicaSet -> Deployment.
//!
//! Missing links are not errors. They mean the pod is an orphan for now and
//! a later event will try again. Only a failing index read is an error.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::api::core::v1::Pod;
use tracing::debug;

use crate::{Indexers, LookupError, ObjectKey};

/// Why a pod could not be tied to a deployment yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orphaned {
    NoOwner,
    NotController,
    ReplicaSetNotIndexed,
    DeploymentNotIndexed,
}

/// Resolve the key of the deployment that (indirectly) controls `pod`.
pub fn resolve_deployment(pod: &Pod, indexers: &Indexers) -> Result<Result<ObjectKey, Orphaned>, LookupError> {
    let ns = pod.metadata.namespace.as_deref();
    let rs_key = match controller_ref(ns, pod.metadata.owner_references.as_deref()) {
        Ok(k) => k,
        Err(o) => return Ok(Err(o)),
    };
    let Some(rs) = indexers.replica_sets.get(&rs_key)? else {
        debug!(rs = %rs_key, "owning replicaset not indexed yet");
        return Ok(Err(Orphaned::ReplicaSetNotIndexed));
    };
    let dep_key = match controller_ref(ns, rs.metadata.owner_references.as_deref()) {
        Ok(k) => k,
        Err(o) => return Ok(Err(o)),
    };
    if indexers.deployments.get(&dep_key)?.is_none() {
        debug!(deployment = %dep_key, "owning deployment not indexed yet");
        return Ok(Err(Orphaned::DeploymentNotIndexed));
    }
    Ok(Ok(dep_key))
}

/// Only the first owner reference is considered, and it must be the controller.
fn controller_ref(ns: Option<&str>, refs: Option<&[OwnerReference]>) -> Result<ObjectKey, Orphaned> {
    let first = refs.and_then(|r| r.first()).ok_or(Orphaned::NoOwner)?;
    if !first.controller.unwrap_or(false) {
        return Err(Orphaned::NotController);
    }
    Ok(ObjectKey::new(ns, &first.name))
}
