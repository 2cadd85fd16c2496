//! List → watch → relist loop keeping one kind's store in step with its source.

use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use futures::StreamExt;
use kmirror_core::{
    key_of, resource_version, ApiResource, ChangeEvent, DynamicObject, ListOptions, ListWatch, SharedObject,
    Snapshot, StreamEvent, TypeMeta,
};
use kmirror_store::Store;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::handler::{Dispatcher, EventHandler};

/// What a relist does with objects whose content did not change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnchangedPolicy {
    /// Keep the stored object and stay silent.
    #[default]
    Skip,
    /// Replace it and fire Updated, like a periodic informer resync.
    Notify,
}

#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    /// Forced relist period while a watch is healthy; zero disables it.
    pub resync: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub unchanged: UnchangedPolicy,
    pub options: ListOptions,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            resync: Duration::ZERO,
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_secs(30),
            unchanged: UnchangedPolicy::Skip,
            options: ListOptions::default(),
        }
    }
}

/// How a watch session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchEnd {
    Cancelled,
    Resync,
    Expired,
    Closed,
    Failed,
}

#[derive(Debug, Default)]
struct PassStats {
    added: usize,
    updated: usize,
    deleted: usize,
    unchanged: usize,
    skipped: usize,
}

pub struct Reflector {
    kind: String,
    source: Arc<dyn ListWatch>,
    store: Arc<Store>,
    dispatcher: Dispatcher,
    shape: Option<ApiResource>,
    cfg: ReflectorConfig,
    synced_tx: watch::Sender<bool>,
}

impl Reflector {
    pub fn new(
        kind: impl Into<String>,
        source: Arc<dyn ListWatch>,
        store: Arc<Store>,
        handler: Arc<dyn EventHandler>,
        cfg: ReflectorConfig,
    ) -> Self {
        let kind = kind.into();
        let (synced_tx, _) = watch::channel(false);
        let dispatcher = Dispatcher::new(kind.clone(), handler);
        Self { kind, source, store, dispatcher, shape: None, cfg, synced_tx }
    }

    /// Stamp `apiVersion`/`kind` from `ar` onto objects arriving without type metadata.
    pub fn with_shape(mut self, ar: ApiResource) -> Self {
        self.shape = Some(ar);
        self
    }

    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Flips to `true` once the first list has been reconciled into the store.
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced_tx.subscribe()
    }

    /// Run until `cancel` fires. Source failures are retried, never returned.
    pub async fn run(self, cancel: CancellationToken) {
        info!(kind = %self.kind, resync_secs = self.cfg.resync.as_secs(), "reflector started");
        let mut backoff = Backoff::new(self.cfg.backoff_initial, self.cfg.backoff_max);
        let mut version = String::new();
        let mut resync_due = false;

        loop {
            let mut opts = self.cfg.options.clone();
            if resync_due && !version.is_empty() {
                opts.resource_version = Some(version.clone());
            }
            metrics::counter!("mirror_relists_total", 1u64, "kind" => self.kind.clone());
            let started = StdInstant::now();
            let listed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.source.list(&opts) => res,
            };
            let snapshot = match listed {
                Ok(s) => s,
                Err(e) => {
                    metrics::counter!("mirror_list_errors_total", 1u64, "kind" => self.kind.clone());
                    let delay = backoff.next_delay();
                    warn!(kind = %self.kind, error = %e, retry_ms = delay.as_millis() as u64, "list failed");
                    if !pause(&cancel, delay).await {
                        break;
                    }
                    continue;
                }
            };
            metrics::histogram!("mirror_list_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => self.kind.clone());
            version = self.reconcile(snapshot);
            self.synced_tx.send_replace(true);

            let deadline = (!self.cfg.resync.is_zero()).then(|| Instant::now() + self.cfg.resync);
            let opened = StdInstant::now();
            let (end, delivered) = self.watch(&cancel, &mut version, deadline).await;
            resync_due = end == WatchEnd::Resync;
            match end {
                WatchEnd::Cancelled => break,
                WatchEnd::Resync => debug!(kind = %self.kind, "resync period elapsed; relisting"),
                WatchEnd::Expired => info!(kind = %self.kind, rv = %version, delivered, "watch version expired"),
                WatchEnd::Closed | WatchEnd::Failed => debug!(kind = %self.kind, ?end, delivered, "watch ended"),
            }
            if end != WatchEnd::Resync {
                metrics::counter!("mirror_watch_restarts_total", 1u64, "kind" => self.kind.clone());
            }
            let lasted = opened.elapsed();
            if let Some(delay) = relist_delay(&mut backoff, end, delivered, lasted, self.cfg.backoff_max) {
                debug!(kind = %self.kind, ?end, retry_ms = delay.as_millis() as u64, "unproductive watch; backing off");
                if !pause(&cancel, delay).await {
                    break;
                }
            }
        }
        info!(kind = %self.kind, "reflector stopped");
    }

    /// Reconcile the store against a full snapshot and return its version marker.
    fn reconcile(&self, snapshot: Snapshot) -> String {
        let mut stats = PassStats::default();
        let mut seen = FxHashSet::default();
        for item in snapshot.items {
            let obj = self.stamp(item);
            let Some(key) = key_of(&obj) else {
                stats.skipped += 1;
                warn!(kind = %self.kind, "listed object has no name; skipped");
                continue;
            };
            seen.insert(key.clone());
            if self.cfg.unchanged == UnchangedPolicy::Skip {
                if let Some(current) = self.store.get(&key) {
                    if unchanged(&current, &obj) {
                        stats.unchanged += 1;
                        continue;
                    }
                }
            }
            match self.upsert(key, Arc::new(obj)) {
                ChangeEvent::Added(_) => stats.added += 1,
                _ => stats.updated += 1,
            }
        }
        for key in self.store.list_keys() {
            if seen.contains(&key) {
                continue;
            }
            if let Some(old) = self.store.delete(&key) {
                stats.deleted += 1;
                self.dispatcher.dispatch(&ChangeEvent::Deleted(old));
            }
        }
        info!(
            kind = %self.kind,
            rv = %snapshot.resource_version,
            added = stats.added,
            updated = stats.updated,
            deleted = stats.deleted,
            unchanged = stats.unchanged,
            skipped = stats.skipped,
            "list reconciled"
        );
        snapshot.resource_version
    }

    async fn watch(
        &self,
        cancel: &CancellationToken,
        version: &mut String,
        deadline: Option<Instant>,
    ) -> (WatchEnd, usize) {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (WatchEnd::Cancelled, 0),
            res = self.source.watch(version, &self.cfg.options) => res,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => {
                warn!(kind = %self.kind, rv = %version, error = %e, "watch failed to open");
                return (WatchEnd::Failed, 0);
            }
        };
        debug!(kind = %self.kind, rv = %version, "watching");
        let mut delivered = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return (WatchEnd::Cancelled, delivered),
                _ = resync_timer(deadline) => return (WatchEnd::Resync, delivered),
                next = stream.next() => next,
            };
            let event = match next {
                None => {
                    debug!(kind = %self.kind, delivered, "watch stream closed");
                    return (WatchEnd::Closed, delivered);
                }
                Some(Err(e)) => {
                    warn!(kind = %self.kind, error = %e, delivered, "watch stream error");
                    return (WatchEnd::Failed, delivered);
                }
                Some(Ok(ev)) => ev,
            };
            match event {
                StreamEvent::Added(obj) | StreamEvent::Modified(obj) => {
                    let obj = self.stamp(obj);
                    if let Some(rv) = resource_version(&obj) {
                        *version = rv.to_string();
                    }
                    let Some(key) = key_of(&obj) else {
                        warn!(kind = %self.kind, "watched object has no name; skipped");
                        continue;
                    };
                    self.upsert(key, Arc::new(obj));
                }
                StreamEvent::Deleted(obj) => {
                    let obj = self.stamp(obj);
                    if let Some(rv) = resource_version(&obj) {
                        *version = rv.to_string();
                    }
                    let Some(key) = key_of(&obj) else {
                        warn!(kind = %self.kind, "deleted object has no name; skipped");
                        continue;
                    };
                    if self.store.delete(&key).is_some() {
                        self.dispatcher.dispatch(&ChangeEvent::Deleted(Arc::new(obj)));
                    } else {
                        debug!(kind = %self.kind, key = %key, "delete for absent key ignored");
                    }
                }
                StreamEvent::Bookmark(rv) => {
                    *version = rv;
                    continue;
                }
                StreamEvent::Expired(reason) => {
                    debug!(kind = %self.kind, reason = %reason, "watch expired");
                    return (WatchEnd::Expired, delivered);
                }
            }
            delivered += 1;
        }
    }

    /// Put `obj` and dispatch Added or Updated depending on whether the key was present.
    fn upsert(&self, key: String, obj: SharedObject) -> ChangeEvent {
        let ev = match self.store.put(key, Arc::clone(&obj)) {
            Some(old) => ChangeEvent::Updated { old, new: obj },
            None => ChangeEvent::Added(obj),
        };
        self.dispatcher.dispatch(&ev);
        ev
    }

    fn stamp(&self, mut obj: DynamicObject) -> DynamicObject {
        if let Some(ar) = &self.shape {
            if obj.types.as_ref().map_or(true, |t| t.kind.is_empty()) {
                obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
            }
        }
        obj
    }
}

/// Same resource version when both carry one, structural equality otherwise.
fn unchanged(current: &DynamicObject, incoming: &DynamicObject) -> bool {
    match (resource_version(current), resource_version(incoming)) {
        (Some(a), Some(b)) => a == b,
        _ => current == incoming,
    }
}

/// Pause owed before relisting after a watch session, or `None` to relist at once.
/// A session that hit the resync deadline, delivered events, or stayed open for
/// `healthy_after` resets the backoff. Anything else, including an immediate
/// expiry, escalates it.
fn relist_delay(
    backoff: &mut Backoff,
    end: WatchEnd,
    delivered: usize,
    lasted: Duration,
    healthy_after: Duration,
) -> Option<Duration> {
    if end == WatchEnd::Resync || delivered > 0 || lasted >= healthy_after {
        backoff.reset();
        None
    } else {
        Some(backoff.next_delay())
    }
}

async fn resync_timer(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Sleep for `delay`; `false` when cancelled first.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = sleep(delay) => true,
    }
}
