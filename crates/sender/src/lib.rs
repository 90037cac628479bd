//! Kinwatch sender: buffered, ordered fan-out of status change records to
//! per-kind subscriber callbacks.
//!
//! A single dispatch loop drains a bounded channel. Callbacks run inline, in
//! registration order, so a slow callback delays every later record.

#![forbid(unsafe_code)]

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use kinwatch_core::{Kind, StatusChangeRecord};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const DEFAULT_CAPACITY: usize = 10;

pub type Callback = Arc<dyn Fn(&StatusChangeRecord) + Send + Sync>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SenderError {
    #[error("sender already started")]
    AlreadyStarted,
    #[error("sender closed")]
    Closed,
}

pub struct Sender {
    pod_callbacks: ArcSwap<Vec<Callback>>,
    deployment_callbacks: ArcSwap<Vec<Callback>>,
    tx: mpsc::Sender<StatusChangeRecord>,
    rx: Mutex<Option<mpsc::Receiver<StatusChangeRecord>>>,
    cancel: CancellationToken,
}

impl Sender {
    /// `cancel` governs the dispatch loop and aborts blocked enqueues.
    pub fn new(capacity: usize, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            pod_callbacks: ArcSwap::from_pointee(Vec::new()),
            deployment_callbacks: ArcSwap::from_pointee(Vec::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            cancel,
        }
    }

    fn callbacks(&self, kind: Kind) -> &ArcSwap<Vec<Callback>> {
        match kind {
            Kind::Pod => &self.pod_callbacks,
            Kind::Deployment => &self.deployment_callbacks,
        }
    }

    /// Register a callback for `kind`. Safe before or after `start`.
    pub fn add_callback(&self, kind: Kind, cb: Callback) {
        self.callbacks(kind).rcu(|cur| {
            let mut next = Vec::clone(cur);
            next.push(Arc::clone(&cb));
            next
        });
    }

    pub fn add_pod_callback(&self, f: impl Fn(&StatusChangeRecord) + Send + Sync + 'static) {
        self.add_callback(Kind::Pod, Arc::new(f));
    }

    pub fn add_deployment_callback(&self, f: impl Fn(&StatusChangeRecord) + Send + Sync + 'static) {
        self.add_callback(Kind::Deployment, Arc::new(f));
    }

    /// Queue a record for dispatch. Blocks while the channel is full, which
    /// pushes back on the controller worker calling it.
    pub async fn enqueue(&self, record: StatusChangeRecord) -> Result<(), SenderError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SenderError::Closed),
            res = self.tx.send(record) => res.map_err(|_| SenderError::Closed),
        }
    }

    /// Spawn the dispatch loop. Only one loop may ever run per sender.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, SenderError> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SenderError::AlreadyStarted)?;
        let me = Arc::clone(self);
        Ok(tokio::spawn(async move { me.run(rx).await }))
    }

    async fn run(&self, mut rx: mpsc::Receiver<StatusChangeRecord>) {
        info!("sender dispatch loop started");
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(rec) => self.dispatch(&rec),
                    None => break,
                },
            }
        }
        info!("sender dispatch loop stopped");
    }

    fn dispatch(&self, rec: &StatusChangeRecord) {
        let cbs = self.callbacks(rec.kind).load();
        debug!(kind = %rec.kind, key = %rec.key, status = %rec.status, callbacks = cbs.len(), "dispatching record");
        for cb in cbs.iter() {
            if catch_unwind(AssertUnwindSafe(|| cb(rec))).is_err() {
                error!(kind = %rec.kind, key = %rec.key, "subscriber callback panicked");
            }
        }
        metrics::counter!("kinwatch_notifications_total", 1u64, "kind" => rec.kind.as_str(), "status" => rec.status.as_str());
    }
}
