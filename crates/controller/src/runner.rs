//! Controller runner: N workers pull keys, re-read the latest object and hand
//! it to the reconciler. Failures are retried with backoff, then dropped.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use kinwatch_core::{EventType, Indexers, Kind, ObjectKey};
use kinwatch_store::WorkQueue;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{log_error_sink, ErrorSink, HandleError, ReconcileFailure, Reconciler};

pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub struct Controller {
    kind: Kind,
    queue: Arc<WorkQueue<ObjectKey>>,
    indexers: Indexers,
    reconciler: Arc<dyn Reconciler>,
    workers: usize,
    max_retries: u32,
    error_sink: ErrorSink,
}

impl Controller {
    pub fn new(kind: Kind, queue: Arc<WorkQueue<ObjectKey>>, indexers: Indexers, reconciler: Arc<dyn Reconciler>) -> Self {
        Self { kind, queue, indexers, reconciler, workers: 1, max_retries: DEFAULT_MAX_RETRIES, error_sink: log_error_sink() }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_error_sink(mut self, sink: ErrorSink) -> Self {
        self.error_sink = sink;
        self
    }

    pub fn kind(&self) -> Kind { self.kind }
    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> { &self.queue }

    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else { return false };
        let started = Instant::now();
        let res = AssertUnwindSafe(self.key_consume(&key)).catch_unwind().await.unwrap_or_else(|_| {
            error!(kind = %self.kind, key = %key, "reconcile panicked");
            Err(HandleError::Panicked)
        });
        metrics::histogram!("kinwatch_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => self.kind.as_str());
        metrics::counter!("kinwatch_reconcile_total", 1u64, "kind" => self.kind.as_str());
        self.handle_err(&key, res);
        self.queue.done(&key);
        true
    }

    /// Always re-read the index: the queue only carries keys, so whatever
    /// happened since the event was queued is folded into this pass.
    async fn key_consume(&self, key: &ObjectKey) -> Result<(), HandleError> {
        let snapshot = self.indexers.snapshot(self.kind, key)?;
        let event = if snapshot.is_some() { EventType::Update } else { EventType::Delete };
        if event == EventType::Delete {
            debug!(kind = %self.kind, key = %key, "object no longer indexed");
        }
        self.reconciler.reconcile(self.kind, event, key, snapshot).await
    }

    fn handle_err(&self, key: &ObjectKey, res: Result<(), HandleError>) {
        let Err(err) = res else {
            self.queue.forget(key);
            return;
        };
        metrics::counter!("kinwatch_reconcile_errors_total", 1u64, "kind" => self.kind.as_str());
        let attempts = self.queue.num_requeues(key);
        if attempts < self.max_retries {
            warn!(kind = %self.kind, key = %key, attempt = attempts + 1, error = %err, "reconcile failed; requeueing");
            self.queue.add_rate_limited(key.clone());
            return;
        }
        self.queue.forget(key);
        metrics::counter!("kinwatch_reconcile_dropped_total", 1u64, "kind" => self.kind.as_str());
        (self.error_sink)(&ReconcileFailure { kind: self.kind, key: key.clone(), attempts: attempts + 1, error: err });
    }

    /// Run workers until `token` is cancelled. In-flight items finish, queued
    /// ones are abandoned, then the queue is closed.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(kind = %self.kind, workers = self.workers, "controller started");
        let mut workers = JoinSet::new();
        for id in 0..self.workers {
            let me = Arc::clone(&self);
            workers.spawn(async move {
                while me.process_next_item().await {}
                debug!(kind = %me.kind, worker = id, "worker exited");
            });
        }
        token.cancelled().await;
        self.queue.shut_down();
        while workers.join_next().await.is_some() {}
        info!(kind = %self.kind, "controller stopped");
    }

    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinwatch_core::{MemoryIndex, Snapshot};
    use kinwatch_store::RateLimit;
    use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
    use k8s_openapi::api::core::v1::Pod;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn pod(name: &str, phase: &str) -> Pod {
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": name, "namespace": "ns" },
            "status": { "phase": phase },
        }))
        .unwrap()
    }

    fn setup() -> (Arc<MemoryIndex<Pod>>, Indexers, Arc<WorkQueue<ObjectKey>>) {
        let pods = Arc::new(MemoryIndex::new());
        let idx = Indexers {
            deployments: Arc::new(MemoryIndex::<Deployment>::new()),
            replica_sets: Arc::new(MemoryIndex::<ReplicaSet>::new()),
            pods: pods.clone(),
        };
        let q = Arc::new(WorkQueue::new("Pod", RateLimit { base: Duration::from_millis(1), max: Duration::from_millis(10) }));
        (pods, idx, q)
    }

    async fn eventually(mut f: impl FnMut() -> bool) {
        for _ in 0..400 {
            if f() { return; }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    struct AlwaysFails { calls: AtomicUsize }

    #[async_trait::async_trait]
    impl Reconciler for AlwaysFails {
        async fn reconcile(&self, kind: Kind, _: EventType, _: &ObjectKey, _: Option<Snapshot>) -> Result<(), HandleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HandleError::KindMismatch { kind, got: kind })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_key_is_retried_five_times_then_reported_once() {
        let (_pods, idx, q) = setup();
        let rec = Arc::new(AlwaysFails { calls: AtomicUsize::new(0) });
        let reports = Arc::new(AtomicUsize::new(0));
        let sink: ErrorSink = {
            let reports = reports.clone();
            Arc::new(move |f: &ReconcileFailure| {
                assert_eq!(f.attempts, 6);
                reports.fetch_add(1, Ordering::SeqCst);
            })
        };
        let ctl = Arc::new(Controller::new(Kind::Pod, q.clone(), idx, rec.clone()).with_error_sink(sink));
        let token = CancellationToken::new();
        let handle = ctl.spawn(token.clone());

        q.add(ObjectKey::new(Some("ns"), "p"));
        eventually(|| reports.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rec.calls.load(Ordering::SeqCst), 6);
        assert_eq!(reports.load(Ordering::SeqCst), 1);
        assert_eq!(q.num_requeues(&ObjectKey::new(Some("ns"), "p")), 0);

        token.cancel();
        handle.await.unwrap();
        assert!(q.is_shutting_down());
    }

    /// Blocks the first pass until released and records what every pass saw.
    struct Gate { release: Notify, seen: Mutex<Vec<(EventType, Option<String>)>> }

    #[async_trait::async_trait]
    impl Reconciler for Gate {
        async fn reconcile(&self, _: Kind, event: EventType, _: &ObjectKey, snap: Option<Snapshot>) -> Result<(), HandleError> {
            let first = {
                let mut seen = self.seen.lock().unwrap();
                let phase = snap.as_ref().and_then(|s| s.as_pod()).and_then(|p| p.status.as_ref()?.phase.clone());
                seen.push((event, phase));
                seen.len() == 1
            };
            if first {
                self.release.notified().await;
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn burst_during_processing_collapses_into_one_pass_with_latest_state() {
        let (pods, idx, q) = setup();
        let key = ObjectKey::new(Some("ns"), "p");
        pods.insert(key.clone(), pod("p", "Pending"));
        let gate = Arc::new(Gate { release: Notify::new(), seen: Mutex::new(Vec::new()) });
        let ctl = Arc::new(Controller::new(Kind::Pod, q.clone(), idx, gate.clone()).with_workers(3));
        let token = CancellationToken::new();
        let handle = ctl.spawn(token.clone());

        q.add(key.clone());
        eventually(|| gate.seen.lock().unwrap().len() == 1).await;
        for phase in ["Running", "Running", "Failed", "Succeeded"] {
            pods.insert(key.clone(), pod("p", phase));
            q.add(key.clone());
        }
        gate.release.notify_one();
        eventually(|| gate.seen.lock().unwrap().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = gate.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2, "one extra pass, not one per event");
        assert_eq!(seen[1], (EventType::Update, Some("Succeeded".to_string())));
        drop(seen);

        pods.remove(&key);
        q.add(key.clone());
        eventually(|| gate.seen.lock().unwrap().len() == 3).await;
        assert_eq!(gate.seen.lock().unwrap()[2], (EventType::Delete, None));

        token.cancel();
        handle.await.unwrap();
    }

    struct PanicsOnce { calls: AtomicUsize }

    #[async_trait::async_trait]
    impl Reconciler for PanicsOnce {
        async fn reconcile(&self, _: Kind, _: EventType, _: &ObjectKey, _: Option<Snapshot>) -> Result<(), HandleError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first pass explodes");
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panic_is_contained_and_retried() {
        let (_pods, idx, q) = setup();
        let rec = Arc::new(PanicsOnce { calls: AtomicUsize::new(0) });
        let ctl = Arc::new(Controller::new(Kind::Pod, q.clone(), idx, rec.clone()));
        let token = CancellationToken::new();
        let handle = ctl.spawn(token.clone());

        let key = ObjectKey::new(Some("ns"), "p");
        q.add(key.clone());
        eventually(|| rec.calls.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.num_requeues(&key), 0, "success clears the retry budget");

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
