//! Kinwatch controllers: per-kind worker pools draining a coalescing queue,
//! and the handler that keeps the relationship tree and statuses current.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kinwatch_core::{EventType, Kind, LookupError, ObjectKey, Snapshot};
use tracing::error;

mod handler;
mod runner;

pub use handler::{DeletionPolicy, Handler};
pub use runner::{Controller, DEFAULT_MAX_RETRIES};

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("{kind} controller received a {got} snapshot")]
    KindMismatch { kind: Kind, got: Kind },
    #[error("reconcile panicked")]
    Panicked,
}

/// Processes one dequeued key. `snapshot` is the latest object read from the
/// index at dequeue time, `None` for deletions.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(
        &self,
        kind: Kind,
        event: EventType,
        key: &ObjectKey,
        snapshot: Option<Snapshot>,
    ) -> Result<(), HandleError>;
}

/// A key whose retries ran out.
#[derive(Debug)]
pub struct ReconcileFailure {
    pub kind: Kind,
    pub key: ObjectKey,
    pub attempts: u32,
    pub error: HandleError,
}

/// Operational error sink for dropped keys.
pub type ErrorSink = Arc<dyn Fn(&ReconcileFailure) + Send + Sync>;

pub fn log_error_sink() -> ErrorSink {
    Arc::new(|f: &ReconcileFailure| {
        error!(kind = %f.kind, key = %f.key, attempts = f.attempts, error = %f.error, "dropping key after retries");
    })
}
