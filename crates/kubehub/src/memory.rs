//! In-process list/watch source backed by a mutable object set.
//!
//! Every mutation bumps a global resource version and is appended to an
//! event log, so watches started from an older version replay what they
//! missed. Tests and offline demos use it to script a remote source,
//! including stream drops, expired versions and failing list calls.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use futures::{stream, StreamExt};
use kmirror_core::{key_of, DynamicObject, EventStream, ListOptions, ListWatch, Snapshot, StreamEvent};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};

const CHANNEL_CAP: usize = 1024;

/// Live event; `None` version marks control events that bypass replay filtering.
type Envelope = (Option<u64>, StreamEvent);

struct Inner {
    objects: BTreeMap<String, DynamicObject>,
    version: u64,
    /// Versions at or below this are no longer watchable.
    floor: u64,
    log: Vec<(u64, StreamEvent)>,
    tx: broadcast::Sender<Envelope>,
    fail_lists: usize,
    list_calls: usize,
    watch_calls: usize,
    last_list: Option<ListOptions>,
}

pub struct MemorySource {
    inner: Mutex<Inner>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAP);
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                version: 0,
                floor: 0,
                log: Vec::new(),
                tx,
                fail_lists: 0,
                list_calls: 0,
                watch_calls: 0,
                last_list: None,
            }),
        }
    }

    pub fn with_objects(objects: impl IntoIterator<Item = DynamicObject>) -> Self {
        let src = Self::new();
        for o in objects {
            src.upsert(o);
        }
        src
    }

    /// Current resource version of the whole source.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Create or replace an object, emitting Added or Modified. Returns the new version.
    /// Nameless objects are ignored.
    pub fn upsert(&self, mut obj: DynamicObject) -> u64 {
        let mut inner = self.inner.lock();
        let Some(key) = key_of(&obj) else { return inner.version };
        inner.version += 1;
        let v = inner.version;
        obj.metadata.resource_version = Some(v.to_string());
        let ev = if inner.objects.insert(key, obj.clone()).is_some() {
            StreamEvent::Modified(obj)
        } else {
            StreamEvent::Added(obj)
        };
        inner.publish(v, ev);
        v
    }

    /// Remove the object under `key`, emitting Deleted. `false` if absent.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(mut obj) = inner.objects.remove(key) else { return false };
        inner.version += 1;
        let v = inner.version;
        obj.metadata.resource_version = Some(v.to_string());
        inner.publish(v, StreamEvent::Deleted(obj));
        true
    }

    /// Change state without telling any watcher; only a relist will notice.
    pub fn upsert_unobserved(&self, mut obj: DynamicObject) {
        let mut inner = self.inner.lock();
        let Some(key) = key_of(&obj) else { return };
        inner.version += 1;
        obj.metadata.resource_version = Some(inner.version.to_string());
        inner.objects.insert(key, obj);
    }

    pub fn delete_unobserved(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.version += 1;
        inner.objects.remove(key).is_some()
    }

    /// End every open watch stream.
    pub fn close_watches(&self) {
        let (tx, _) = broadcast::channel(CHANNEL_CAP);
        self.inner.lock().tx = tx;
    }

    /// Send an expiry to every open watch, close them, and compact the log so
    /// that resuming from any version seen so far is refused.
    pub fn expire_watches(&self) {
        let mut inner = self.inner.lock();
        let _ = inner.tx.send((None, StreamEvent::Expired("too old resource version".into())));
        inner.floor = inner.version;
        inner.log.clear();
        let (tx, _) = broadcast::channel(CHANNEL_CAP);
        inner.tx = tx;
    }

    /// Make the next `n` list calls fail.
    pub fn fail_next_lists(&self, n: usize) {
        self.inner.lock().fail_lists = n;
    }

    pub fn list_calls(&self) -> usize {
        self.inner.lock().list_calls
    }

    pub fn watch_calls(&self) -> usize {
        self.inner.lock().watch_calls
    }

    /// Options passed to the most recent list call.
    pub fn last_list_options(&self) -> Option<ListOptions> {
        self.inner.lock().last_list.clone()
    }
}

impl Inner {
    fn publish(&mut self, version: u64, ev: StreamEvent) {
        self.log.push((version, ev.clone()));
        let _ = self.tx.send((Some(version), ev));
    }
}

#[async_trait::async_trait]
impl ListWatch for MemorySource {
    async fn list(&self, opts: &ListOptions) -> Result<Snapshot> {
        let mut inner = self.inner.lock();
        inner.list_calls += 1;
        inner.last_list = Some(opts.clone());
        if inner.fail_lists > 0 {
            inner.fail_lists -= 1;
            bail!("list unavailable");
        }
        Ok(Snapshot { items: inner.objects.values().cloned().collect(), resource_version: inner.version.to_string() })
    }

    async fn watch(&self, version: &str, _opts: &ListOptions) -> Result<EventStream> {
        let from: u64 = if version.is_empty() { 0 } else { version.parse().context("parsing resource version")? };
        let mut inner = self.inner.lock();
        inner.watch_calls += 1;
        if from > inner.version {
            return Err(anyhow!("resource version {} is in the future", from));
        }
        if from < inner.floor {
            let expired = StreamEvent::Expired(format!("resource version {} is too old", from));
            return Ok(stream::iter(vec![Ok(expired)]).boxed());
        }
        let upto = inner.version;
        let rx = inner.tx.subscribe();
        let replay: Vec<Result<StreamEvent>> =
            inner.log.iter().filter(|(v, _)| *v > from).map(|(_, ev)| Ok(ev.clone())).collect();
        drop(inner);

        let live = stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok((Some(v), _)) if v <= upto => continue,
                    Ok((_, ev)) => return Some((Ok(ev), rx)),
                    Err(RecvError::Lagged(n)) => return Some((Err(anyhow!("watch lagged by {} events", n)), rx)),
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream::iter(replay).chain(live).boxed())
    }
}
