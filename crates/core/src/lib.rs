//! kmirror core types: object identity, change events and the list/watch
//! contract every mirrored kind is fed through.

#![forbid(unsafe_code)]

use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use kube::core::{ApiResource, DynamicObject, TypeMeta};

/// Objects are shared between the primary map, index buckets and readers.
pub type SharedObject = Arc<DynamicObject>;

/// Well-known resource tags used by the CLI and demos.
pub mod resource {
    pub const NAMESPACE: &str = "namespace";
    pub const POD: &str = "pod";
    pub const DEPLOYMENT: &str = "deployment";
    pub const STATEFULSET: &str = "statefulset";
    pub const SERVICE: &str = "service";
    pub const CONFIGMAP: &str = "configmap";
}

/// Store key for a namespace/name pair. Cluster-scoped objects are keyed by name alone.
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Store key of an object, `None` when it carries no name.
pub fn key_of(obj: &DynamicObject) -> Option<String> {
    let name = obj.metadata.name.as_deref().filter(|n| !n.is_empty())?;
    Some(object_key(namespace_of(obj), name))
}

pub fn namespace_of(obj: &DynamicObject) -> &str {
    obj.metadata.namespace.as_deref().unwrap_or("")
}

pub fn resource_version(obj: &DynamicObject) -> Option<&str> {
    obj.metadata.resource_version.as_deref().filter(|rv| !rv.is_empty())
}

pub fn kind_of(obj: &DynamicObject) -> Option<&str> {
    obj.types.as_ref().map(|t| t.kind.as_str()).filter(|k| !k.is_empty())
}

/// Observed mutation of a mirrored kind.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Added(SharedObject),
    Updated { old: SharedObject, new: SharedObject },
    Deleted(SharedObject),
}

impl ChangeEvent {
    /// The object as it is after the event (the removed object for deletes).
    pub fn object(&self) -> &SharedObject {
        match self {
            ChangeEvent::Added(o) | ChangeEvent::Deleted(o) => o,
            ChangeEvent::Updated { new, .. } => new,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChangeEvent::Added(_) => "added",
            ChangeEvent::Updated { .. } => "updated",
            ChangeEvent::Deleted(_) => "deleted",
        }
    }
}

/// Filter applied to both list and watch calls of a kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Version marker for a list; `None` asks for a full, most recent snapshot.
    pub resource_version: Option<String>,
    /// Server-side timeout for watch calls.
    pub timeout_secs: Option<u32>,
}

impl ListOptions {
    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string());
        self
    }

    pub fn at(mut self, version: &str) -> Self {
        self.resource_version = Some(version.to_string());
        self
    }
}

/// Point-in-time list result.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub items: Vec<DynamicObject>,
    /// Version marker to start the following watch from.
    pub resource_version: String,
}

/// One item of a change stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Added(DynamicObject),
    Modified(DynamicObject),
    Deleted(DynamicObject),
    /// Progress marker with no object change.
    Bookmark(String),
    /// The version marker is too old; the stream cannot continue.
    Expired(String),
}

pub type EventStream = BoxStream<'static, anyhow::Result<StreamEvent>>;

/// Remote source of truth for one kind: a snapshot call and a change stream.
///
/// Both calls may be made any number of times; the reflector reconciles the
/// store against every snapshot, so repeated calls never duplicate state.
#[async_trait::async_trait]
pub trait ListWatch: Send + Sync {
    async fn list(&self, opts: &ListOptions) -> anyhow::Result<Snapshot>;

    /// Open a change stream carrying every change after `version`.
    async fn watch(&self, version: &str, opts: &ListOptions) -> anyhow::Result<EventStream>;
}

pub mod prelude {
    pub use super::{
        key_of, object_key, ChangeEvent, DynamicObject, EventStream, ListOptions, ListWatch,
        SharedObject, Snapshot, StreamEvent,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn obj(ns: Option<&str>, name: Option<&str>) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                namespace: ns.map(str::to_string),
                name: name.map(str::to_string),
                ..Default::default()
            },
            data: serde_json::Value::Null,
        }
    }

    #[test]
    fn namespaced_key_joins_with_slash() {
        assert_eq!(object_key("a", "x"), "a/x");
        assert_eq!(key_of(&obj(Some("a"), Some("x"))).as_deref(), Some("a/x"));
    }

    #[test]
    fn cluster_scoped_key_is_name() {
        assert_eq!(object_key("", "node-1"), "node-1");
        assert_eq!(key_of(&obj(None, Some("node-1"))).as_deref(), Some("node-1"));
    }

    #[test]
    fn nameless_object_has_no_key() {
        assert!(key_of(&obj(Some("a"), None)).is_none());
        assert!(key_of(&obj(Some("a"), Some(""))).is_none());
    }

    #[test]
    fn change_event_exposes_current_object() {
        let old = Arc::new(obj(Some("a"), Some("x")));
        let new = Arc::new(obj(Some("a"), Some("x2")));
        let ev = ChangeEvent::Updated { old, new: new.clone() };
        assert!(Arc::ptr_eq(ev.object(), &new));
        assert_eq!(ev.label(), "updated");
    }
}
