//! kmirror kubehub: reflectors, event dispatch and kube-rs backed list/watch.

#![forbid(unsafe_code)]

mod backoff;
mod handler;
mod memory;
mod reflector;

pub use backoff::Backoff;
pub use handler::{Dispatcher, EventHandler, HandlerFns, LoggingHandler, NoopHandler};
pub use memory::MemorySource;
pub use reflector::{Reflector, ReflectorConfig, UnchangedPolicy};

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kmirror_core::{ApiResource, DynamicObject, EventStream, ListOptions, ListWatch, Snapshot, StreamEvent};
use kube::{
    api::{Api, ListParams, VersionMatch, WatchParams},
    core::{GroupVersionKind, WatchEvent},
    discovery::{Discovery, Scope},
    Client,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Served kinds (incl. CRDs), sorted by group, version and kind.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await.context("running api discovery")?;
    let mut out: Vec<DiscoveredResource> = discovery
        .groups()
        .flat_map(|g| g.recommended_resources())
        .map(|(ar, caps)| DiscoveredResource {
            group: ar.group,
            version: ar.version,
            kind: ar.kind,
            namespaced: matches!(caps.scope, Scope::Namespaced),
        })
        .collect();
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind::gvk(group, version, kind))
        }
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve a GVK to its served resource and whether it is namespaced.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running api discovery")?;
    let found = discovery
        .groups()
        .flat_map(|g| g.recommended_resources())
        .find(|(ar, _)| ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind)
        .map(|(ar, caps)| (ar, matches!(caps.scope, Scope::Namespaced)));
    found.ok_or_else(|| anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// List/watch over a kube-rs dynamic API handle.
#[derive(Clone)]
pub struct KubeListWatch {
    api: Api<DynamicObject>,
}

impl KubeListWatch {
    pub fn new(api: Api<DynamicObject>) -> Self {
        Self { api }
    }

    /// Resolve `gvk_key` through discovery and build a source scoped to `namespace`
    /// (all namespaces when `None` or for cluster-scoped kinds).
    pub async fn for_gvk(client: Client, gvk_key: &str, namespace: Option<&str>) -> Result<(Self, ApiResource)> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api = match namespace {
            Some(ns) if namespaced => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        info!(gvk = %gvk_key, ns = ?namespace, namespaced, "list/watch source resolved");
        Ok((Self::new(api), ar))
    }
}

fn list_params(opts: &ListOptions) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(labels) = &opts.label_selector {
        lp = lp.labels(labels);
    }
    if let Some(fields) = &opts.field_selector {
        lp = lp.fields(fields);
    }
    if let Some(rv) = &opts.resource_version {
        lp = lp.at(rv).matching(VersionMatch::NotOlderThan);
    }
    lp
}

fn watch_params(opts: &ListOptions) -> WatchParams {
    let mut wp = WatchParams::default();
    if let Some(labels) = &opts.label_selector {
        wp = wp.labels(labels);
    }
    if let Some(fields) = &opts.field_selector {
        wp = wp.fields(fields);
    }
    if let Some(secs) = opts.timeout_secs {
        wp = wp.timeout(secs);
    }
    wp
}

fn map_event(ev: WatchEvent<DynamicObject>) -> Result<StreamEvent> {
    Ok(match ev {
        WatchEvent::Added(o) => StreamEvent::Added(o),
        WatchEvent::Modified(o) => StreamEvent::Modified(o),
        WatchEvent::Deleted(o) => StreamEvent::Deleted(o),
        WatchEvent::Bookmark(b) => StreamEvent::Bookmark(b.metadata.resource_version),
        WatchEvent::Error(e) if e.code == 410 => StreamEvent::Expired(e.message),
        WatchEvent::Error(e) => return Err(anyhow!("watch error {}: {}", e.code, e.message)),
    })
}

#[async_trait::async_trait]
impl ListWatch for KubeListWatch {
    async fn list(&self, opts: &ListOptions) -> Result<Snapshot> {
        let list = self.api.list(&list_params(opts)).await.context("listing objects")?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        debug!(items = list.items.len(), rv = %resource_version, "list ok");
        Ok(Snapshot { items: list.items, resource_version })
    }

    async fn watch(&self, version: &str, opts: &ListOptions) -> Result<EventStream> {
        let stream = self.api.watch(&watch_params(opts), version).await.context("opening watch")?;
        Ok(stream.map(|res| res.map_err(anyhow::Error::from).and_then(map_event)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_gvk_key_parses_core_and_group() {
        let core = parse_gvk_key("v1/ConfigMap").expect("ok");
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "ConfigMap"));
        let apps = parse_gvk_key("apps/v1/Deployment").expect("ok");
        assert_eq!((apps.group.as_str(), apps.kind.as_str()), ("apps", "Deployment"));
    }

    #[test]
    fn parse_gvk_key_invalid_returns_err() {
        assert!(parse_gvk_key("invalid").is_err());
        assert!(parse_gvk_key("").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
        assert!(parse_gvk_key("v1/").is_err());
    }

    #[test]
    fn resync_list_uses_not_older_than() {
        let lp = list_params(&ListOptions::default().labels("app=web").at("42"));
        assert_eq!(lp.label_selector.as_deref(), Some("app=web"));
        assert_eq!(lp.resource_version.as_deref(), Some("42"));
        assert!(matches!(lp.version_match, Some(VersionMatch::NotOlderThan)));
        assert!(list_params(&ListOptions::default()).resource_version.is_none());
    }

    #[test]
    fn gone_error_maps_to_expired() {
        let gone = kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version".into(),
            reason: "Expired".into(),
            code: 410,
        };
        assert!(matches!(map_event(WatchEvent::Error(gone)), Ok(StreamEvent::Expired(_))));
        let other = kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        };
        assert!(map_event(WatchEvent::Error(other)).is_err());
    }
}
