//! Index functions: named mappings from an object to zero or more index values.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use kmirror_core::{namespace_of, DynamicObject};

pub const INDEX_NAMESPACE: &str = "namespace";
pub const INDEX_OWNER: &str = "owner";

/// Pure function from an object to its index values.
pub type IndexFn = Arc<dyn Fn(&DynamicObject) -> Result<Vec<String>> + Send + Sync>;

/// Named set of index functions registered for one kind.
#[derive(Clone, Default)]
pub struct Indexers {
    funcs: BTreeMap<String, IndexFn>,
}

impl Indexers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&DynamicObject) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        self.insert(name, f);
        self
    }

    pub fn insert<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&DynamicObject) -> Result<Vec<String>> + Send + Sync + 'static,
    {
        self.funcs.insert(name.to_string(), Arc::new(f));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// Index names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.funcs.keys().map(String::as_str)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &IndexFn)> {
        self.funcs.iter().map(|(k, f)| (k.as_str(), f))
    }
}

impl fmt::Debug for Indexers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.funcs.keys()).finish()
    }
}

/// Namespace and owner indexes.
pub fn default_indexers() -> Indexers {
    Indexers::new()
        .with(INDEX_NAMESPACE, namespace_index)
        .with(INDEX_OWNER, owner_index)
}

/// Single value: the object's namespace, empty for cluster-scoped objects.
pub fn namespace_index(obj: &DynamicObject) -> Result<Vec<String>> {
    Ok(vec![namespace_of(obj).to_string()])
}

/// One value per owner reference, formatted `namespace/ownerName`. Cluster-scoped
/// objects give `/ownerName`. Objects without a name or without owners yield no values.
pub fn owner_index(obj: &DynamicObject) -> Result<Vec<String>> {
    if obj.metadata.name.as_deref().map_or(true, str::is_empty) {
        return Ok(Vec::new());
    }
    let ns = namespace_of(obj);
    Ok(obj
        .metadata
        .owner_references
        .iter()
        .flatten()
        .map(|owner| format!("{}/{}", ns, owner.name))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::core::ObjectMeta;

    fn obj(ns: Option<&str>, name: Option<&str>, owners: &[&str]) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                namespace: ns.map(str::to_string),
                name: name.map(str::to_string),
                owner_references: if owners.is_empty() {
                    None
                } else {
                    Some(
                        owners
                            .iter()
                            .map(|o| OwnerReference { name: o.to_string(), ..Default::default() })
                            .collect(),
                    )
                },
                ..Default::default()
            },
            data: serde_json::Value::Null,
        }
    }

    #[test]
    fn namespace_index_yields_namespace_or_empty() {
        assert_eq!(namespace_index(&obj(Some("a"), Some("x"), &[])).unwrap(), vec!["a"]);
        assert_eq!(namespace_index(&obj(None, Some("node"), &[])).unwrap(), vec![""]);
    }

    #[test]
    fn owner_index_one_value_per_owner() {
        let o = obj(Some("a"), Some("child"), &["parent", "other"]);
        assert_eq!(owner_index(&o).unwrap(), vec!["a/parent", "a/other"]);
        // cluster-scoped children keep the separator
        let node_owned = obj(None, Some("child"), &["parent"]);
        assert_eq!(owner_index(&node_owned).unwrap(), vec!["/parent"]);
    }

    #[test]
    fn owner_index_empty_without_owners_or_name() {
        assert!(owner_index(&obj(Some("a"), Some("x"), &[])).unwrap().is_empty());
        assert!(owner_index(&obj(Some("a"), None, &["parent"])).unwrap().is_empty());
    }

    #[test]
    fn default_indexers_register_both() {
        let ix = default_indexers();
        assert_eq!(ix.names().collect::<Vec<_>>(), vec![INDEX_NAMESPACE, INDEX_OWNER]);
        assert!(format!("{:?}", ix).contains("owner"));
    }
}
