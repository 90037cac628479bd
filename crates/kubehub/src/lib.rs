//! Kinwatch kubehub: kube reflectors for Deployments, ReplicaSets and Pods,
//! feeding object keys into the controller queues and serving point-in-time
//! lookups from the reflector stores.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::hash::Hash;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kinwatch_core::{Indexers, LookupError, ObjectKey, ObjectLookup};
use kinwatch_store::WorkQueue;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{
        reflector::{self, ObjectRef, Store},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config, Resource,
};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(30 * 60);

/// Build a client from an explicit kubeconfig, or the usual in-cluster /
/// `KUBECONFIG` discovery when no path is given.
pub async fn client(kubeconfig: Option<&Path>) -> Result<Client> {
    let Some(path) = kubeconfig else {
        return Client::try_default().await.context("building default kube client");
    };
    let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
    let cfg = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("loading kubeconfig {}", path.display()))?;
    Client::try_from(cfg).context("building kube client")
}

/// `ObjectLookup` over a reflector store.
pub struct StoreLookup<K: Resource + 'static>(Store<K>)
where
    K::DynamicType: Eq + Hash;

impl<K> StoreLookup<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    pub fn new(store: Store<K>) -> Self { Self(store) }
}

impl<K> ObjectLookup<K> for StoreLookup<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default + Send + Sync,
{
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<K>>, LookupError> {
        let mut oref = ObjectRef::<K>::new(key.name());
        if let Some(ns) = key.namespace() {
            oref = oref.within(ns);
        }
        Ok(self.0.get(&oref))
    }

    fn keys(&self) -> Vec<ObjectKey> {
        self.0.state().iter().filter_map(|o| ObjectKey::from_meta(o.meta())).collect()
    }
}

/// Queues fed by the informers. ReplicaSets feed none: they only back
/// ownership resolution.
pub struct Feeds {
    pub deployments: Arc<WorkQueue<ObjectKey>>,
    pub pods: Arc<WorkQueue<ObjectKey>>,
}

#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Restrict every informer to one namespace; `None` watches all.
    pub namespace: Option<String>,
    /// Re-enqueue every indexed key this often; zero disables.
    pub resync: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self { Self { namespace: None, resync: DEFAULT_RESYNC } }
}

pub struct Informers {
    deployments: Store<Deployment>,
    replica_sets: Store<ReplicaSet>,
    pods: Store<Pod>,
    tasks: Vec<JoinHandle<()>>,
}

impl Informers {
    /// Spawn one reflector task per kind. Tasks run until `token` is cancelled.
    pub fn start(client: &Client, cfg: &InformerConfig, feeds: Feeds, token: &CancellationToken) -> Self {
        let ns = cfg.namespace.as_deref();
        let (deployments, d_task) =
            spawn_informer(api::<Deployment>(client, ns), Some(feeds.deployments), cfg.resync, token.clone());
        let (replica_sets, rs_task) = spawn_informer(api::<ReplicaSet>(client, ns), None, cfg.resync, token.clone());
        let (pods, p_task) = spawn_informer(api::<Pod>(client, ns), Some(feeds.pods), cfg.resync, token.clone());
        info!(ns = ?ns, resync_secs = cfg.resync.as_secs(), "informers started");
        Self { deployments, replica_sets, pods, tasks: vec![d_task, rs_task, p_task] }
    }

    pub fn indexers(&self) -> Indexers {
        Indexers {
            deployments: Arc::new(StoreLookup::new(self.deployments.clone())),
            replica_sets: Arc::new(StoreLookup::new(self.replica_sets.clone())),
            pods: Arc::new(StoreLookup::new(self.pods.clone())),
        }
    }

    /// Wait until every store has completed its initial list.
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<()> {
        wait_for_stores(&self.deployments, &self.replica_sets, &self.pods, timeout).await
    }

    pub async fn join(self) {
        for t in self.tasks {
            if let Err(e) = t.await {
                warn!(error = %e, "informer task failed");
            }
        }
    }
}

async fn wait_for_stores(
    deployments: &Store<Deployment>,
    replica_sets: &Store<ReplicaSet>,
    pods: &Store<Pod>,
    timeout: Duration,
) -> Result<()> {
    let started = Instant::now();
    let all = async {
        deployments.wait_until_ready().await?;
        replica_sets.wait_until_ready().await?;
        pods.wait_until_ready().await
    };
    tokio::time::timeout(timeout, all)
        .await
        .map_err(|_| anyhow!("informer caches not synced within {}s", timeout.as_secs()))?
        .context("informer stopped before its cache synced")?;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "informer caches synced");
    Ok(())
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn spawn_informer<K>(
    api: Api<K>,
    queue: Option<Arc<WorkQueue<ObjectKey>>>,
    resync: Duration,
    token: CancellationToken,
) -> (Store<K>, JoinHandle<()>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default + Send + Sync,
{
    let (reader, writer) = reflector::store::<K>();
    let store = reader.clone();
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let task = tokio::spawn(async move {
        let stream = reflector::reflector(writer, watcher::watcher(api, watcher::Config::default()).default_backoff());
        futures::pin_mut!(stream);
        let mut resync_timer = (!resync.is_zero()).then(|| tokio::time::interval_at(Instant::now() + resync, resync));
        info!(kind = %kind, "watcher started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = next_tick(&mut resync_timer) => {
                    if let Some(q) = queue.as_deref() {
                        let keys: Vec<ObjectKey> = reader.state().iter().filter_map(|o| ObjectKey::from_meta(o.meta())).collect();
                        debug!(kind = %kind, count = keys.len(), "resync");
                        keys.into_iter().for_each(|k| q.add(k));
                    }
                }
                ev = stream.next() => match ev {
                    Some(Ok(ev)) => {
                        if let Some(q) = queue.as_deref() {
                            feed(&kind, q, &ev);
                        }
                    }
                    Some(Err(e)) => {
                        metrics::counter!("kinwatch_watch_errors_total", 1u64, "kind" => kind.clone());
                        warn!(kind = %kind, error = %e, "watch error; backing off");
                    }
                    None => {
                        warn!(kind = %kind, "watcher stream ended");
                        break;
                    }
                },
            }
        }
        info!(kind = %kind, "watcher stopped");
    });
    (store, task)
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn feed<K: Resource>(kind: &str, queue: &WorkQueue<ObjectKey>, ev: &Event<K>) {
    let push = |o: &K| match ObjectKey::from_meta(o.meta()) {
        Some(k) => queue.add(k),
        None => debug!(kind = %kind, "object without a name skipped"),
    };
    match ev {
        Event::Applied(o) | Event::Deleted(o) => push(o),
        Event::Restarted(list) => {
            debug!(kind = %kind, count = list.len(), "watch restart");
            list.iter().for_each(push);
        }
    }
}
