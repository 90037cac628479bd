//! Kinwatch public façade.
//!
//! A [`Watcher`] owns the whole pipeline: event source, per-kind controllers,
//! the relationship cache and the notification sender. Subscribers register
//! callbacks per kind and receive a [`StatusChangeRecord`] for every status
//! transition or deletion.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use kinwatch_controller::{log_error_sink, Controller, Handler};
use kinwatch_kubehub::{Feeds, Informers};
use kinwatch_sender::Sender;
use kinwatch_store::{RelationshipCache, WorkQueue};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;

pub use config::{ConfigError, WatcherConfig};
pub use kinwatch_controller::{DeletionPolicy, ErrorSink, ReconcileFailure};
pub use kinwatch_core::{
    EventType, Indexers, Kind, LookupError, MemoryIndex, ObjectKey, ObjectLookup, Snapshot, Status, StatusChangeRecord,
};
pub use kinwatch_sender::Callback;
pub use kinwatch_store::TreeView;

struct Queues {
    deployments: Arc<WorkQueue<ObjectKey>>,
    pods: Arc<WorkQueue<ObjectKey>>,
}

impl Queues {
    fn new(config: &WatcherConfig) -> Self {
        Self {
            deployments: Arc::new(WorkQueue::new(Kind::Deployment.as_str(), config.rate_limit())),
            pods: Arc::new(WorkQueue::new(Kind::Pod.as_str(), config.rate_limit())),
        }
    }

    fn get(&self, kind: Kind) -> &Arc<WorkQueue<ObjectKey>> {
        match kind {
            Kind::Deployment => &self.deployments,
            Kind::Pod => &self.pods,
        }
    }
}

pub struct Watcher {
    token: CancellationToken,
    cache: Arc<RelationshipCache>,
    sender: Arc<Sender>,
    queues: Queues,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Watcher {
    /// Start against caller-supplied indexes. Keys are fed with
    /// [`Watcher::enqueue`]. Must be called within a tokio runtime.
    pub fn start(indexers: Indexers, config: WatcherConfig) -> Result<Self, ConfigError> {
        Self::start_with_sink(indexers, config, log_error_sink())
    }

    pub fn start_with_sink(indexers: Indexers, config: WatcherConfig, sink: ErrorSink) -> Result<Self, ConfigError> {
        config.validate()?;
        let queues = Queues::new(&config);
        Ok(Self::assemble(indexers, &config, queues, sink, CancellationToken::new(), Vec::new()))
    }

    /// Start against a cluster: list+watch Deployments, ReplicaSets and Pods,
    /// wait for the caches to sync, then run the controllers. Any failure
    /// cancels what was already started.
    pub async fn connect(client: kube::Client, config: WatcherConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid watcher configuration")?;
        let token = CancellationToken::new();
        let queues = Queues::new(&config);
        let feeds = Feeds { deployments: queues.deployments.clone(), pods: queues.pods.clone() };
        let informers = Informers::start(&client, &config.informers(), feeds, &token);
        if let Err(e) = informers.wait_for_sync(config.cache_sync_timeout).await {
            token.cancel();
            queues.deployments.shut_down();
            queues.pods.shut_down();
            informers.join().await;
            return Err(e);
        }
        let indexers = informers.indexers();
        let informer_task = tokio::spawn(informers.join());
        Ok(Self::assemble(indexers, &config, queues, log_error_sink(), token, vec![informer_task]))
    }

    fn assemble(
        indexers: Indexers,
        config: &WatcherConfig,
        queues: Queues,
        sink: ErrorSink,
        token: CancellationToken,
        mut tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        let cache = Arc::new(RelationshipCache::new());
        let sender = Arc::new(Sender::new(config.sender_capacity, token.clone()));
        if let Ok(h) = sender.start() {
            tasks.push(h);
        }
        let handler = Arc::new(
            Handler::new(cache.clone(), sender.clone(), indexers.clone(), config.deletion_policy())
                .with_pod_queue(queues.pods.clone()),
        );
        for (kind, workers) in [(Kind::Deployment, config.deployment_workers), (Kind::Pod, config.pod_workers)] {
            let ctl = Controller::new(kind, queues.get(kind).clone(), indexers.clone(), handler.clone())
                .with_workers(workers)
                .with_max_retries(config.max_retries)
                .with_error_sink(sink.clone());
            tasks.push(Arc::new(ctl).spawn(token.clone()));
        }
        info!(
            deployment_workers = config.deployment_workers,
            pod_workers = config.pod_workers,
            ns = ?config.namespace,
            "watcher started"
        );
        Self { token, cache, sender, queues, tasks: Mutex::new(tasks), closed: AtomicBool::new(false) }
    }

    /// Queue `key` for reconciliation by the `kind` controller.
    pub fn enqueue(&self, kind: Kind, key: ObjectKey) { self.queues.get(kind).add(key); }

    pub fn add_callback(&self, kind: Kind, cb: Callback) { self.sender.add_callback(kind, cb); }

    pub fn add_pod_callback(&self, f: impl Fn(&StatusChangeRecord) + Send + Sync + 'static) {
        self.sender.add_pod_callback(f);
    }

    pub fn add_deployment_callback(&self, f: impl Fn(&StatusChangeRecord) + Send + Sync + 'static) {
        self.sender.add_deployment_callback(f);
    }

    /// Current hierarchy, parents first, ordered by key.
    pub fn tree(&self) -> Vec<TreeView> { self.cache.roots() }

    pub fn cache(&self) -> &Arc<RelationshipCache> { &self.cache }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::SeqCst) }

    /// Stop everything. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        info!("watcher closing");
    }

    /// Wait for every background task to exit. Returns once `close` has been
    /// called and the tasks have drained.
    pub async fn wait(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for t in tasks {
            if let Err(e) = t.await {
                warn!(error = %e, "watcher task failed");
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) { self.token.cancel(); }
}
