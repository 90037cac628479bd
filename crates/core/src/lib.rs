//! Kinwatch core types: kinds, statuses, keys, snapshots and status records.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

pub mod lookup;
pub mod owner;
pub mod policy;

pub use lookup::{Indexers, LookupError, MemoryIndex, ObjectLookup};

/// Resource kinds tracked in the relationship tree.
///
/// `ReplicaSet` is deliberately absent: it is only consulted while resolving
/// pod ownership and never becomes a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Kind {
    Deployment,
    Pod,
}

impl Kind {
    pub const ALL: [Kind; 2] = [Kind::Deployment, Kind::Pod];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Deployment => "Deployment",
            Kind::Pod => "Pod",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Normalized status of a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Default,
    Succeeded,
    Failed,
    Deleted,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Default => "default",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::Deleted => "deleted",
        }
    }

    pub fn is_deleted(&self) -> bool { matches!(self, Status::Deleted) }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// How a dequeued key is classified after re-reading the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// The object exists (covers add as well as update).
    Update,
    /// The object is gone from the index.
    Delete,
}

/// Stable `namespace/name` identifier. Cluster-scoped objects are just `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        let ns = namespace.unwrap_or("");
        Self(format!("{}/{}", ns, name).trim_matches('/').to_string())
    }

    pub fn namespace(&self) -> Option<&str> {
        self.0.split_once('/').map(|(ns, _)| ns)
    }

    pub fn name(&self) -> &str {
        self.0.split_once('/').map(|(_, name)| name).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str { &self.0 }

    /// Key for an object's metadata; `None` when the object has no name yet.
    pub fn from_meta(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> Option<Self> {
        meta.name.as_deref().map(|name| Self::new(meta.namespace.as_deref(), name))
    }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self { Self(s.trim_matches('/').to_string()) }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Last-seen raw object for a node. Shared with the index, never mutated.
#[derive(Debug, Clone)]
pub enum Snapshot {
    Deployment(Arc<Deployment>),
    Pod(Arc<Pod>),
}

impl Snapshot {
    pub fn kind(&self) -> Kind {
        match self {
            Snapshot::Deployment(_) => Kind::Deployment,
            Snapshot::Pod(_) => Kind::Pod,
        }
    }

    pub fn name(&self) -> &str {
        let meta = match self {
            Snapshot::Deployment(d) => &d.metadata,
            Snapshot::Pod(p) => &p.metadata,
        };
        meta.name.as_deref().unwrap_or("")
    }

    pub fn as_pod(&self) -> Option<&Pod> {
        match self {
            Snapshot::Pod(p) => Some(p),
            Snapshot::Deployment(_) => None,
        }
    }

    /// Derived `(status, reason)` according to the per-kind status policy.
    pub fn status(&self) -> (Status, String) {
        match self {
            Snapshot::Deployment(d) => policy::deployment_status(d),
            Snapshot::Pod(p) => policy::pod_status(p),
        }
    }
}

/// Notification payload describing one observed status transition or deletion.
#[derive(Debug, Clone, Serialize)]
pub struct StatusChangeRecord {
    pub key: ObjectKey,
    pub kind: Kind,
    pub name: String,
    pub status: Status,
    pub reason: String,
    /// Key of the owning node, if attached.
    pub parent_key: Option<ObjectKey>,
    #[serde(skip_serializing)]
    pub snapshot: Option<Snapshot>,
    pub observed_at: DateTime<Utc>,
}

/// Join a message and a short reason as `message/reason`, dropping empty parts.
pub fn concat_reason(message: &str, reason: &str) -> String {
    format!("{}/{}", message, reason).trim_matches('/').to_string()
}
