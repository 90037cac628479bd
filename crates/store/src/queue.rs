//! Coalescing work queue with per-item exponential backoff.
//!
//! An item is in one of: absent, queued (`dirty` + `queue`), processing, or
//! processing and dirty again. Adding an item that is already queued or being
//! processed only marks it dirty, so a burst of events for one key collapses
//! into a single extra pass once the current one finishes.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RateLimit {
    fn default() -> Self { Self { base: Duration::from_millis(5), max: Duration::from_secs(1000) } }
}

impl RateLimit {
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    failures: FxHashMap<T, u32>,
    shutting_down: bool,
}

pub struct WorkQueue<T> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    notify: Notify,
    limit: RateLimit,
    shutdown: CancellationToken,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    /// `name` labels the queue in logs and metrics.
    pub fn new(name: &'static str, limit: RateLimit) -> Self {
        Self {
            name,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                failures: FxHashMap::default(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limit,
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn name(&self) -> &'static str { self.name }
    pub fn len(&self) -> usize { self.lock().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    pub fn add(&self, item: T) {
        let mut st = self.lock();
        if st.shutting_down || st.dirty.contains(&item) {
            return;
        }
        st.dirty.insert(item.clone());
        if st.processing.contains(&item) {
            trace!(queue = self.name, ?item, "item in flight; marked dirty");
            return;
        }
        st.queue.push_back(item);
        metrics::gauge!("kinwatch_queue_depth", st.queue.len() as f64, "kind" => self.name);
        drop(st);
        self.notify.notify_one();
    }

    /// Add `item` once `delay` has passed, unless the queue shuts down first.
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let q = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => q.add(item),
                _ = q.shutdown.cancelled() => {}
            }
        });
    }

    /// Re-add after this item's backoff and bump its failure count.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut st = self.lock();
            let n = st.failures.entry(item.clone()).or_insert(0);
            let delay = self.limit.delay(*n);
            *n = n.saturating_add(1);
            delay
        };
        self.add_after(item, delay);
    }

    /// Clear the failure count for `item`.
    pub fn forget(&self, item: &T) { self.lock().failures.remove(item); }

    pub fn num_requeues(&self, item: &T) -> u32 { self.lock().failures.get(item).copied().unwrap_or(0) }

    /// Wait for the next item. Returns `None` once the queue is shut down;
    /// items still queued at that point are abandoned.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    metrics::gauge!("kinwatch_queue_depth", st.queue.len() as f64, "kind" => self.name);
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Mark `item` finished. If it was re-added meanwhile it goes back in line.
    pub fn done(&self, item: &T) {
        let mut st = self.lock();
        st.processing.remove(item);
        if st.dirty.contains(item) && !st.shutting_down {
            st.queue.push_back(item.clone());
            drop(st);
            self.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue<String>> {
        Arc::new(WorkQueue::new("test", RateLimit { base: Duration::from_millis(1), max: Duration::from_millis(20) }))
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let q = queue();
        q.add("a".into());
        q.add("a".into());
        q.add("b".into());
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn readd_while_processing_runs_once_more() {
        let q = queue();
        q.add("a".into());
        let item = q.get().await.unwrap();
        for _ in 0..10 {
            q.add("a".into());
        }
        assert_eq!(q.len(), 0, "in-flight item is not queued twice");
        q.done(&item);
        assert_eq!(q.len(), 1);
        let again = q.get().await.unwrap();
        q.done(&again);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn rate_limited_items_come_back_and_count() {
        let q = queue();
        q.add_rate_limited("a".into());
        q.add_rate_limited("a".into());
        assert_eq!(q.num_requeues(&"a".to_string()), 2);
        let got = tokio::time::timeout(Duration::from_secs(1), q.get()).await.unwrap();
        assert_eq!(got.as_deref(), Some("a"));
        q.forget(&"a".to_string());
        assert_eq!(q.num_requeues(&"a".to_string()), 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let q = queue();
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shut_down();
        let res = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(res.is_none());
        q.add("late".into());
        assert!(q.is_empty());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let l = RateLimit { base: Duration::from_millis(5), max: Duration::from_millis(100) };
        assert_eq!(l.delay(0), Duration::from_millis(5));
        assert_eq!(l.delay(1), Duration::from_millis(10));
        assert_eq!(l.delay(3), Duration::from_millis(40));
        assert_eq!(l.delay(10), Duration::from_millis(100));
        assert_eq!(l.delay(64), Duration::from_millis(100));
    }
}
