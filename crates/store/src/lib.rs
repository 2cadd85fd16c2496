//! kmirror store: thread-safe key → object map with secondary indexes.
//!
//! Every mutation recomputes the key's index memberships before taking the
//! write lock, then swaps the primary entry and its memberships in one
//! critical section. Readers never observe an index entry whose object is
//! absent from the primary map, or the reverse.

#![forbid(unsafe_code)]

mod index;

pub use index::{
    default_indexers, namespace_index, owner_index, IndexFn, Indexers, INDEX_NAMESPACE, INDEX_OWNER,
};

use kmirror_core::{DynamicObject, SharedObject};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("index not found: {0}")]
    IndexNotFound(String),
}

/// Values one object contributes to a single index.
type Values = SmallVec<[String; 1]>;

struct Entry {
    obj: SharedObject,
    /// Aligned with `Store::names`.
    values: Vec<Values>,
}

#[derive(Default)]
struct Inner {
    items: FxHashMap<String, Entry>,
    /// Per index: value → keys. Empty buckets are removed.
    indices: Vec<FxHashMap<String, FxHashSet<String>>>,
}

impl Inner {
    fn link(&mut self, key: &str, values: &[Values]) {
        for (idx, vals) in values.iter().enumerate() {
            for v in vals {
                self.indices[idx].entry(v.clone()).or_default().insert(key.to_string());
            }
        }
    }

    fn unlink(&mut self, key: &str, values: &[Values]) {
        for (idx, vals) in values.iter().enumerate() {
            for v in vals {
                if let Some(bucket) = self.indices[idx].get_mut(v) {
                    bucket.remove(key);
                    if bucket.is_empty() {
                        self.indices[idx].remove(v);
                    }
                }
            }
        }
    }
}

/// Indexed store for one kind.
pub struct Store {
    kind: String,
    indexers: Indexers,
    names: Vec<String>,
    inner: RwLock<Inner>,
}

impl Store {
    /// The namespace index is always installed so namespace lookups share the index path.
    pub fn new(kind: impl Into<String>, mut indexers: Indexers) -> Self {
        if !indexers.contains(INDEX_NAMESPACE) {
            indexers.insert(INDEX_NAMESPACE, namespace_index);
        }
        let names: Vec<String> = indexers.names().map(str::to_string).collect();
        let inner = Inner { items: FxHashMap::default(), indices: vec![FxHashMap::default(); names.len()] };
        Self { kind: kind.into(), indexers, names, inner: RwLock::new(inner) }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn index_names(&self) -> &[String] {
        &self.names
    }

    fn compute(&self, obj: &DynamicObject) -> Vec<Values> {
        self.indexers
            .iter()
            .map(|(name, f)| match f(obj) {
                Ok(mut vals) => {
                    vals.sort_unstable();
                    vals.dedup();
                    vals.into_iter().collect()
                }
                Err(e) => {
                    warn!(kind = %self.kind, index = %name, error = %e, "index function failed; object left out of index");
                    Values::new()
                }
            })
            .collect()
    }

    /// Insert or replace `key`, returning the previous object.
    pub fn put(&self, key: String, obj: SharedObject) -> Option<SharedObject> {
        let values = self.compute(&obj);
        let (old, len) = {
            let mut inner = self.inner.write();
            let old = inner.items.remove(&key);
            if let Some(prev) = &old {
                inner.unlink(&key, &prev.values);
            }
            inner.link(&key, &values);
            inner.items.insert(key, Entry { obj, values });
            (old.map(|e| e.obj), inner.items.len())
        };
        self.record_len(len);
        old
    }

    /// Remove `key` and all of its index memberships. Absent keys are a no-op.
    pub fn delete(&self, key: &str) -> Option<SharedObject> {
        let (old, len) = {
            let mut inner = self.inner.write();
            let old = inner.items.remove(key);
            if let Some(prev) = &old {
                inner.unlink(key, &prev.values);
            }
            (old.map(|e| e.obj), inner.items.len())
        };
        if old.is_some() {
            self.record_len(len);
        }
        old
    }

    pub fn get(&self, key: &str) -> Option<SharedObject> {
        self.inner.read().items.get(key).map(|e| e.obj.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().items.contains_key(key)
    }

    /// All current objects, unordered.
    pub fn list(&self) -> Vec<SharedObject> {
        self.inner.read().items.values().map(|e| e.obj.clone()).collect()
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.inner.read().items.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn position(&self, index: &str) -> Result<usize, StoreError> {
        self.names
            .iter()
            .position(|n| n == index)
            .ok_or_else(|| StoreError::IndexNotFound(index.to_string()))
    }

    /// Objects whose `index` function yields `value`. Unknown index names are an error,
    /// values with no members are an empty result.
    pub fn by_index(&self, index: &str, value: &str) -> Result<Vec<SharedObject>, StoreError> {
        let pos = self.position(index)?;
        let inner = self.inner.read();
        Ok(inner.indices[pos]
            .get(value)
            .map(|keys| keys.iter().filter_map(|k| inner.items.get(k)).map(|e| e.obj.clone()).collect())
            .unwrap_or_default())
    }

    /// Store keys in the `value` bucket of `index`.
    pub fn index_keys(&self, index: &str, value: &str) -> Result<Vec<String>, StoreError> {
        let pos = self.position(index)?;
        let inner = self.inner.read();
        Ok(inner.indices[pos].get(value).map(|keys| keys.iter().cloned().collect()).unwrap_or_default())
    }

    /// Every value currently present in `index`.
    pub fn index_values(&self, index: &str) -> Result<Vec<String>, StoreError> {
        let pos = self.position(index)?;
        Ok(self.inner.read().indices[pos].keys().cloned().collect())
    }

    pub fn by_namespace(&self, namespace: &str) -> Vec<SharedObject> {
        self.by_index(INDEX_NAMESPACE, namespace).unwrap_or_default()
    }

    fn record_len(&self, len: usize) {
        metrics::gauge!("mirror_store_objects", len as f64, "kind" => self.kind.clone());
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("kind", &self.kind).field("indexes", &self.names).field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kmirror_core::key_of;
    use kube::core::ObjectMeta;

    fn obj(ns: &str, name: &str, owners: &[&str]) -> SharedObject {
        Arc::new(DynamicObject {
            types: None,
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                owner_references: Some(
                    owners.iter().map(|o| OwnerReference { name: o.to_string(), ..Default::default() }).collect(),
                ),
                ..Default::default()
            },
            data: serde_json::json!({}),
        })
    }

    fn put(store: &Store, o: SharedObject) -> Option<SharedObject> {
        store.put(key_of(&o).unwrap(), o)
    }

    fn names(mut v: Vec<SharedObject>) -> Vec<String> {
        let mut out: Vec<String> = v.drain(..).map(|o| o.metadata.name.clone().unwrap_or_default()).collect();
        out.sort();
        out
    }

    #[test]
    fn put_get_list_and_keys() {
        let s = Store::new("widget", default_indexers());
        assert!(put(&s, obj("a", "x", &[])).is_none());
        put(&s, obj("b", "y", &[]));
        assert_eq!(s.len(), 2);
        assert!(s.get("a/x").is_some());
        assert!(s.get("a/y").is_none());
        let mut keys = s.list_keys();
        keys.sort();
        assert_eq!(keys, vec!["a/x", "b/y"]);
        assert_eq!(names(s.list()), vec!["x", "y"]);
    }

    #[test]
    fn replace_moves_index_membership() {
        let s = Store::new("widget", default_indexers());
        put(&s, obj("a", "child", &["parent"]));
        assert_eq!(names(s.by_index(INDEX_OWNER, "a/parent").unwrap()), vec!["child"]);

        let old = put(&s, obj("a", "child", &["other"])).expect("previous object");
        assert_eq!(old.metadata.owner_references.as_ref().unwrap()[0].name, "parent");
        assert!(s.by_index(INDEX_OWNER, "a/parent").unwrap().is_empty());
        assert_eq!(names(s.by_index(INDEX_OWNER, "a/other").unwrap()), vec!["child"]);
        assert_eq!(s.index_values(INDEX_OWNER).unwrap(), vec!["a/other"]);
    }

    #[test]
    fn delete_removes_object_and_memberships() {
        let s = Store::new("widget", default_indexers());
        put(&s, obj("a", "x", &["p"]));
        assert!(s.delete("a/x").is_some());
        assert!(s.get("a/x").is_none());
        assert!(s.by_namespace("a").is_empty());
        assert!(s.by_index(INDEX_OWNER, "a/p").unwrap().is_empty());
        assert!(s.index_values(INDEX_NAMESPACE).unwrap().is_empty());
        // second delete is a no-op
        assert!(s.delete("a/x").is_none());
    }

    #[test]
    fn unknown_index_is_not_found_but_unknown_value_is_empty() {
        let s = Store::new("widget", default_indexers());
        put(&s, obj("a", "x", &[]));
        assert!(matches!(s.by_index("nope", "a"), Err(StoreError::IndexNotFound(n)) if n == "nope"));
        assert!(s.index_keys("nope", "a").is_err());
        assert!(s.by_index(INDEX_NAMESPACE, "zzz").unwrap().is_empty());
    }

    #[test]
    fn namespace_index_installed_when_missing() {
        let s = Store::new("widget", Indexers::new());
        put(&s, obj("a", "x", &[]));
        assert_eq!(s.index_names(), &["namespace".to_string()]);
        assert_eq!(names(s.by_namespace("a")), vec!["x"]);
    }

    #[test]
    fn re_put_of_same_object_keeps_index_state() {
        let s = Store::new("widget", default_indexers());
        put(&s, obj("a", "x", &["p"]));
        put(&s, obj("a", "x", &["p"]));
        assert_eq!(s.len(), 1);
        assert_eq!(s.index_keys(INDEX_OWNER, "a/p").unwrap(), vec!["a/x"]);
        assert_eq!(s.index_keys(INDEX_NAMESPACE, "a").unwrap(), vec!["a/x"]);
    }

    #[test]
    fn failing_index_function_degrades_to_no_values() {
        let ix = default_indexers().with("broken", |_o: &DynamicObject| Err(anyhow::anyhow!("bad metadata")));
        let s = Store::new("widget", ix);
        put(&s, obj("a", "x", &[]));
        assert!(s.get("a/x").is_some());
        assert!(s.index_values("broken").unwrap().is_empty());
        assert_eq!(names(s.by_namespace("a")), vec!["x"]);
    }

    #[test]
    fn duplicate_values_from_one_function_are_collapsed() {
        let ix = Indexers::new().with("dup", |_o: &DynamicObject| Ok(vec!["v".to_string(), "v".to_string()]));
        let s = Store::new("widget", ix);
        put(&s, obj("a", "x", &[]));
        s.delete("a/x");
        assert!(s.index_values("dup").unwrap().is_empty());
    }
}
