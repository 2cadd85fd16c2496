//! kmirror registry: one indexed store and reflector per resource kind, behind
//! a uniform read API keyed by the kind's tag.
//!
//! Kinds are registered before [`Mirror::start`]; afterwards the mirror is
//! typically shared as `Arc<Mirror>` with readers (REST layers, CLIs).
//! Queries against a tag that was never registered return empty results.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kmirror_core::{ApiResource, ListOptions, ListWatch, SharedObject};
use kmirror_kubehub::{EventHandler, LoggingHandler, Reflector, ReflectorConfig, UnchangedPolicy};
use kmirror_store::{default_indexers, Indexers, Store, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use kmirror_core::{object_key, resource};
pub use kmirror_store::{INDEX_NAMESPACE, INDEX_OWNER};

/// Errors surfaced to mirror callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum MirrorError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already registered: {0}")]
    AlreadyRegistered(String),
    #[error("mirror already started")]
    AlreadyStarted,
}

impl From<StoreError> for MirrorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::IndexNotFound(name) => MirrorError::NotFound(format!("index {}", name)),
        }
    }
}

pub type MirrorResult<T> = Result<T, MirrorError>;

/// Runtime settings shared by every registered kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Default forced relist period; 0 disables it.
    pub resync_secs: u64,
    pub backoff_initial_ms: u64,
    pub watch_backoff_max_secs: u64,
    pub sync_timeout_secs: u64,
    pub watch_timeout_secs: u32,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            resync_secs: 0,
            backoff_initial_ms: 200,
            watch_backoff_max_secs: 30,
            sync_timeout_secs: 30,
            watch_timeout_secs: 290,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl MirrorConfig {
    /// Defaults overridden by `KMIRROR_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            resync_secs: env_or("KMIRROR_RESYNC_SECS", d.resync_secs),
            backoff_initial_ms: env_or("KMIRROR_BACKOFF_INITIAL_MS", d.backoff_initial_ms),
            watch_backoff_max_secs: env_or("KMIRROR_WATCH_BACKOFF_MAX_SECS", d.watch_backoff_max_secs),
            sync_timeout_secs: env_or("KMIRROR_SYNC_TIMEOUT_SECS", d.sync_timeout_secs),
            watch_timeout_secs: env_or("KMIRROR_WATCH_TIMEOUT_SECS", d.watch_timeout_secs),
        }
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

/// Registration record for one resource kind.
pub struct ResourceKind {
    tag: String,
    source: Arc<dyn ListWatch>,
    shape: Option<ApiResource>,
    resync: Option<Duration>,
    handler: Arc<dyn EventHandler>,
    indexers: Indexers,
    options: ListOptions,
    unchanged: UnchangedPolicy,
}

impl ResourceKind {
    /// A kind with default indexers, the logging handler and the mirror-wide resync period.
    pub fn new(tag: impl Into<String>, source: Arc<dyn ListWatch>) -> Self {
        Self {
            tag: tag.into(),
            source,
            shape: None,
            resync: None,
            handler: Arc::new(LoggingHandler),
            indexers: default_indexers(),
            options: ListOptions::default(),
            unchanged: UnchangedPolicy::default(),
        }
    }

    pub fn shape(mut self, ar: ApiResource) -> Self {
        self.shape = Some(ar);
        self
    }

    /// Overrides the mirror-wide period; `Duration::ZERO` disables resync for this kind.
    pub fn resync(mut self, period: Duration) -> Self {
        self.resync = Some(period);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn indexers(mut self, indexers: Indexers) -> Self {
        self.indexers = indexers;
        self
    }

    pub fn options(mut self, options: ListOptions) -> Self {
        self.options = options;
        self
    }

    pub fn unchanged(mut self, policy: UnchangedPolicy) -> Self {
        self.unchanged = policy;
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

/// Outcome of waiting for the first full list of every kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub synced: Vec<String>,
    pub timed_out: Vec<String>,
}

impl SyncReport {
    pub fn all_synced(&self) -> bool {
        self.timed_out.is_empty()
    }
}

struct KindEntry {
    store: Arc<Store>,
    synced: watch::Receiver<bool>,
    /// Taken when the mirror starts.
    reflector: Mutex<Option<Reflector>>,
}

pub struct Mirror {
    config: MirrorConfig,
    kinds: BTreeMap<String, KindEntry>,
    started: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for Mirror {
    fn default() -> Self {
        Self::new(MirrorConfig::default())
    }
}

impl Mirror {
    pub fn new(config: MirrorConfig) -> Self {
        Self {
            config,
            kinds: BTreeMap::new(),
            started: AtomicBool::new(false),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Install a kind. Must happen before [`Mirror::start`].
    pub fn register(&mut self, kind: ResourceKind) -> MirrorResult<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(MirrorError::AlreadyStarted);
        }
        if self.kinds.contains_key(&kind.tag) {
            return Err(MirrorError::AlreadyRegistered(kind.tag));
        }
        let mut options = kind.options;
        options.timeout_secs.get_or_insert(self.config.watch_timeout_secs);
        let cfg = ReflectorConfig {
            resync: kind.resync.unwrap_or_else(|| self.config.resync()),
            backoff_initial: Duration::from_millis(self.config.backoff_initial_ms),
            backoff_max: Duration::from_secs(self.config.watch_backoff_max_secs),
            unchanged: kind.unchanged,
            options,
        };
        let store = Arc::new(Store::new(kind.tag.clone(), kind.indexers));
        let mut reflector = Reflector::new(kind.tag.clone(), kind.source, Arc::clone(&store), kind.handler, cfg);
        if let Some(ar) = kind.shape {
            reflector = reflector.with_shape(ar);
        }
        let synced = reflector.synced();
        info!(kind = %kind.tag, indexes = ?store.index_names(), "kind registered");
        self.kinds.insert(kind.tag, KindEntry { store, synced, reflector: Mutex::new(Some(reflector)) });
        Ok(())
    }

    /// Launch one reflector task per kind and return immediately.
    /// Reflectors stop when `cancel` fires or on [`Mirror::shutdown`].
    pub fn start(&self, cancel: &CancellationToken) -> MirrorResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MirrorError::AlreadyStarted);
        }
        let token = cancel.child_token();
        let mut tasks = self.tasks.lock();
        for (tag, entry) in &self.kinds {
            let Some(reflector) = entry.reflector.lock().take() else { continue };
            debug!(kind = %tag, "starting reflector");
            tasks.push(tokio::spawn(reflector.run(token.clone())));
        }
        *self.cancel.lock() = Some(token);
        info!(kinds = self.kinds.len(), "mirror started");
        Ok(())
    }

    /// Start, then block until every kind has completed one full list or `timeout` elapses.
    /// Kinds that time out keep reflecting in the background.
    pub async fn start_and_wait_until_synced(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> MirrorResult<SyncReport> {
        self.start(cancel)?;
        let t0 = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let waits = self.kinds.iter().map(|(tag, entry)| {
            let rx = entry.synced.clone();
            async move {
                let ok = tokio::select! {
                    _ = cancel.cancelled() => false,
                    res = tokio::time::timeout_at(deadline, wait_synced(rx)) => res.unwrap_or(false),
                };
                (tag.clone(), ok)
            }
        });
        let mut report = SyncReport::default();
        for (tag, ok) in futures::future::join_all(waits).await {
            if ok {
                debug!(kind = %tag, "kind synced");
                report.synced.push(tag);
            } else {
                error!(kind = %tag, timeout_ms = timeout.as_millis() as u64, "timeout waiting for kind to sync");
                report.timed_out.push(tag);
            }
        }
        info!(
            synced = report.synced.len(),
            timed_out = report.timed_out.len(),
            took_ms = %t0.elapsed().as_millis(),
            "mirror sync wait done"
        );
        Ok(report)
    }

    /// Stop every reflector and wait for their tasks to finish. Store content is kept.
    pub async fn shutdown(&self) {
        if let Some(token) = self.cancel.lock().as_ref() {
            token.cancel();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "reflector task failed");
            }
        }
        info!("mirror stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.kinds.keys().map(String::as_str).collect()
    }

    pub fn has_synced(&self, kind: &str) -> bool {
        self.kinds.get(kind).map_or(false, |e| *e.synced.borrow())
    }

    /// Direct access to a kind's store.
    pub fn store(&self, kind: &str) -> Option<Arc<Store>> {
        self.kinds.get(kind).map(|e| Arc::clone(&e.store))
    }

    pub fn list(&self, kind: &str) -> Vec<SharedObject> {
        self.kinds.get(kind).map(|e| e.store.list()).unwrap_or_default()
    }

    pub fn list_namespaced(&self, kind: &str, namespace: &str) -> Vec<SharedObject> {
        self.kinds.get(kind).map(|e| e.store.by_namespace(namespace)).unwrap_or_default()
    }

    pub fn list_keys(&self, kind: &str) -> Vec<String> {
        self.kinds.get(kind).map(|e| e.store.list_keys()).unwrap_or_default()
    }

    pub fn get_by_key(&self, kind: &str, key: &str) -> Option<SharedObject> {
        self.kinds.get(kind).and_then(|e| e.store.get(key))
    }

    /// Objects in the `value` bucket of `index`. Unknown kinds give an empty result,
    /// unknown index names on a known kind are `NotFound`.
    pub fn index_lookup(&self, kind: &str, index: &str, value: &str) -> MirrorResult<Vec<SharedObject>> {
        match self.kinds.get(kind) {
            Some(e) => Ok(e.store.by_index(index, value)?),
            None => Ok(Vec::new()),
        }
    }
}

async fn wait_synced(mut rx: watch::Receiver<bool>) -> bool {
    loop {
        if *rx.borrow_and_update() {
            return true;
        }
        if rx.changed().await.is_err() {
            return *rx.borrow();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmirror_kubehub::MemorySource;

    #[test]
    fn config_defaults() {
        let c = MirrorConfig::default();
        assert_eq!(c.resync(), Duration::ZERO);
        assert_eq!(c.sync_timeout(), Duration::from_secs(30));
        assert_eq!(c.watch_backoff_max_secs, 30);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut m = Mirror::default();
        let src: Arc<dyn ListWatch> = Arc::new(MemorySource::new());
        m.register(ResourceKind::new("widget", src.clone())).unwrap();
        assert_eq!(
            m.register(ResourceKind::new("widget", src)),
            Err(MirrorError::AlreadyRegistered("widget".into()))
        );
        assert_eq!(m.kinds(), vec!["widget"]);
    }

    #[test]
    fn store_error_maps_to_not_found() {
        let e: MirrorError = StoreError::IndexNotFound("color".into()).into();
        assert_eq!(e, MirrorError::NotFound("index color".into()));
        assert_eq!(e.to_string(), "not_found: index color");
    }

    #[test]
    fn unregistered_kind_reads_are_empty() {
        let m = Mirror::default();
        assert!(m.list("nonexistent-kind").is_empty());
        assert!(m.list_namespaced("nonexistent-kind", "a").is_empty());
        assert!(m.list_keys("nonexistent-kind").is_empty());
        assert!(m.get_by_key("nonexistent-kind", "a/x").is_none());
        assert!(matches!(m.index_lookup("nonexistent-kind", INDEX_OWNER, "a/p"), Ok(v) if v.is_empty()));
        assert!(m.store("nonexistent-kind").is_none());
        assert!(!m.has_synced("nonexistent-kind"));
    }
}
