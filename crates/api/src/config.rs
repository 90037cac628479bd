//! Watcher configuration: defaults, `KINWATCH_*` environment overrides and
//! validation.

use std::time::Duration;

use kinwatch_controller::{DeletionPolicy, DEFAULT_MAX_RETRIES};
use kinwatch_kubehub::{InformerConfig, DEFAULT_CACHE_SYNC_TIMEOUT, DEFAULT_RESYNC};
use kinwatch_sender::DEFAULT_CAPACITY;
use kinwatch_store::RateLimit;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("backoff base {base:?} exceeds backoff max {max:?}")]
    Backoff { base: Duration, max: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
    pub deployment_workers: usize,
    pub pod_workers: usize,
    /// Bounded notification channel size.
    pub sender_capacity: usize,
    /// Failed reconciles are retried this many times before the key is dropped.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Zero disables periodic resync.
    pub resync: Duration,
    pub cache_sync_timeout: Duration,
    pub namespace: Option<String>,
    pub infer_deployment_deletion: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        let limit = RateLimit::default();
        Self {
            deployment_workers: 1,
            pod_workers: 1,
            sender_capacity: DEFAULT_CAPACITY,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: limit.base,
            backoff_max: limit.max,
            resync: DEFAULT_RESYNC,
            cache_sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
            namespace: None,
            infer_deployment_deletion: true,
        }
    }
}

impl WatcherConfig {
    /// Defaults overridden by `KINWATCH_*` variables. Unparsable values fall
    /// back to the default.
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |k: &str| get(k).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            deployment_workers: num("KINWATCH_DEPLOYMENT_WORKERS").map_or(d.deployment_workers, |v| v as usize),
            pod_workers: num("KINWATCH_POD_WORKERS").map_or(d.pod_workers, |v| v as usize),
            sender_capacity: num("KINWATCH_SENDER_CAPACITY").map_or(d.sender_capacity, |v| v as usize),
            max_retries: num("KINWATCH_MAX_RETRIES").and_then(|v| u32::try_from(v).ok()).unwrap_or(d.max_retries),
            backoff_base: num("KINWATCH_BACKOFF_BASE_MS").map_or(d.backoff_base, Duration::from_millis),
            backoff_max: num("KINWATCH_BACKOFF_MAX_SECS").map_or(d.backoff_max, Duration::from_secs),
            resync: num("KINWATCH_RESYNC_SECS").map_or(d.resync, Duration::from_secs),
            cache_sync_timeout: num("KINWATCH_CACHE_SYNC_SECS").map_or(d.cache_sync_timeout, Duration::from_secs),
            namespace: get("KINWATCH_NAMESPACE").map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
            infer_deployment_deletion: get("KINWATCH_INFER_DEPLOYMENT_DELETION")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(d.infer_deployment_deletion),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deployment_workers == 0 {
            return Err(ConfigError::Zero("deployment_workers"));
        }
        if self.pod_workers == 0 {
            return Err(ConfigError::Zero("pod_workers"));
        }
        if self.sender_capacity == 0 {
            return Err(ConfigError::Zero("sender_capacity"));
        }
        if self.cache_sync_timeout.is_zero() {
            return Err(ConfigError::Zero("cache_sync_timeout"));
        }
        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::Backoff { base: self.backoff_base, max: self.backoff_max });
        }
        Ok(())
    }

    pub fn rate_limit(&self) -> RateLimit { RateLimit { base: self.backoff_base, max: self.backoff_max } }

    pub fn deletion_policy(&self) -> DeletionPolicy {
        DeletionPolicy { infer_deployment_deletion: self.infer_deployment_deletion }
    }

    pub fn informers(&self) -> InformerConfig {
        InformerConfig { namespace: self.namespace.clone(), resync: self.resync }
    }
}
