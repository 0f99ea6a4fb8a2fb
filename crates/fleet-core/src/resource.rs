//! Control-plane resource model.
//!
//! [`Resource`] is a lightly typed view of an API object: the fields the
//! service reasons about are typed, everything else is preserved verbatim so
//! it can be forwarded to clients unchanged.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::version::ResourceVersion;

/// Metadata fields the API server maintains that are never cached or sent.
const SERVER_ONLY_FIELDS: &[&str] = &["managedFields", "selfLink"];

/// Object metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name, unique within kind and namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Namespace, absent for cluster-scoped objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Version token for the observed state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<ResourceVersion>,
    /// Server assigned identity, stable across updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    /// Owner references, kept opaque.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_references: Option<Vec<Value>>,
    /// Any other metadata field.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A control-plane object.
///
/// # Example
///
/// ```rust
/// use fleet_core::Resource;
///
/// let mut resource: Resource = serde_json::from_value(serde_json::json!({
///     "kind": "ConfigMap",
///     "apiVersion": "v1",
///     "metadata": {"name": "console-config", "namespace": "mce", "selfLink": "/x"},
///     "data": {"LOG_LEVEL": "debug"}
/// }))
/// .unwrap();
///
/// resource.strip_server_fields();
/// assert!(!resource.metadata.extra.contains_key("selfLink"));
/// assert_eq!(resource.string_map("data").get("LOG_LEVEL").map(String::as_str), Some("debug"));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Object kind, e.g. `ManagedCluster`.
    #[serde(default)]
    pub kind: String,
    /// API group and version.
    #[serde(default)]
    pub api_version: String,
    /// Object metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
    /// Observed state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    /// Unknown top-level fields (`data` on ConfigMaps and the like).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Resource {
    /// Create a resource with the given identity and nothing else.
    pub fn new(
        kind: impl Into<String>,
        api_version: impl Into<String>,
        namespace: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            api_version: api_version.into(),
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Object name, if present.
    pub fn name(&self) -> Option<&str> {
        self.metadata.name.as_deref().filter(|n| !n.is_empty())
    }

    /// Namespace, if the object is namespaced.
    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref().filter(|n| !n.is_empty())
    }

    /// Server assigned uid.
    pub fn uid(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    /// Version of the observed state.
    pub fn resource_version(&self) -> Option<&ResourceVersion> {
        self.metadata.resource_version.as_ref()
    }

    /// Identity of the object, `None` when kind or name is missing.
    pub fn key(&self) -> Option<ResourceKey> {
        if self.kind.is_empty() {
            return None;
        }
        let name = self.name()?;
        Some(ResourceKey::new(
            self.kind.clone(),
            self.namespace().unwrap_or_default(),
            name,
        ))
    }

    /// Remove metadata the server maintains for its own bookkeeping.
    pub fn strip_server_fields(&mut self) {
        for field in SERVER_ONLY_FIELDS {
            self.metadata.extra.remove(*field);
        }
    }

    /// The minimal form broadcast for a deleted object.
    #[must_use]
    pub fn tombstone(&self) -> Resource {
        Resource {
            kind: self.kind.clone(),
            api_version: self.api_version.clone(),
            metadata: ObjectMeta {
                name: self.metadata.name.clone(),
                namespace: self.metadata.namespace.clone(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// The `status.compliant` field, if set.
    pub fn compliance(&self) -> Option<&str> {
        self.status.as_ref()?.get("compliant")?.as_str()
    }

    /// Overwrite `status.compliant`, creating the status object if needed.
    pub fn set_compliance(&mut self, state: &str) {
        let status = self
            .status
            .get_or_insert_with(|| Value::Object(Map::new()));
        if !status.is_object() {
            *status = Value::Object(Map::new());
        }
        if let Value::Object(map) = status {
            map.insert("compliant".to_string(), Value::String(state.to_string()));
        }
    }

    /// A top-level string map such as ConfigMap `data`; non-string values are skipped.
    pub fn string_map(&self, field: &str) -> BTreeMap<String, String> {
        self.extra
            .get(field)
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Identity of a resource in the cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    /// Object kind.
    pub kind: String,
    /// Namespace, empty for cluster-scoped objects.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

impl ResourceKey {
    /// Create a new key.
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object.
    pub fn cluster_scoped(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind, String::new(), name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}
