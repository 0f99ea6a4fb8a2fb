//! Watch targets and request paths.

use std::fmt;

use fleet_core::{ApiVersion, ResourceVersion};

/// One resource collection to watch, optionally narrowed by selectors.
///
/// # Example
///
/// ```rust
/// use fleet_watch::WatchTarget;
///
/// let target = WatchTarget::new("v1", "secrets")
///     .label("cluster.open-cluster-management.io/credentials", "");
/// assert_eq!(
///     target.path(None),
///     "/api/v1/secrets?watch&labelSelector=cluster.open-cluster-management.io/credentials=&allowWatchBookmarks"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchTarget {
    /// API group and version.
    pub api_version: ApiVersion,
    /// Resource collection name, e.g. `managedClusters`.
    pub plural: String,
    /// Label selector terms.
    pub label_selector: Vec<(String, String)>,
    /// Field selector terms.
    pub field_selector: Vec<(String, String)>,
}

impl WatchTarget {
    /// Watch every object of a collection.
    pub fn new(api_version: impl Into<ApiVersion>, plural: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            plural: plural.into(),
            label_selector: Vec::new(),
            field_selector: Vec::new(),
        }
    }

    /// Add a label selector term.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.label_selector.push((key.into(), value.into()));
        self
    }

    /// Add a field selector term.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.field_selector.push((key.into(), value.into()));
        self
    }

    /// Request path, resuming from `resume` when given.
    pub fn path(&self, resume: Option<&ResourceVersion>) -> String {
        let mut path = format!(
            "{}/{}/{}?watch",
            self.api_version.api_root(),
            self.api_version,
            self.plural.to_lowercase()
        );
        for (key, value) in &self.label_selector {
            path.push_str(&format!("&labelSelector={key}={value}"));
        }
        if !self.field_selector.is_empty() {
            let terms: Vec<String> = self
                .field_selector
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            path.push_str("&fieldSelector=");
            path.push_str(&terms.join(","));
        }
        path.push_str("&allowWatchBookmarks");
        if let Some(version) = resume.filter(|v| !v.is_empty()) {
            path.push_str(&format!("&resourceVersion={version}"));
        }
        path
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.plural.to_lowercase())?;
        let selectors: Vec<String> = self
            .label_selector
            .iter()
            .chain(self.field_selector.iter())
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if !selectors.is_empty() {
            write!(f, "[{}]", selectors.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouped_path() {
        let target = WatchTarget::new("cluster.open-cluster-management.io/v1", "managedClusters");
        assert_eq!(
            target.path(None),
            "/apis/cluster.open-cluster-management.io/v1/managedclusters?watch&allowWatchBookmarks"
        );
    }

    #[test]
    fn field_selectors_are_comma_joined() {
        let target = WatchTarget::new("v1", "configmaps")
            .field("metadata.namespace", "openshift-config-managed")
            .field("metadata.name", "console-public");
        assert_eq!(
            target.path(None),
            "/api/v1/configmaps?watch&fieldSelector=metadata.namespace=openshift-config-managed,metadata.name=console-public&allowWatchBookmarks"
        );
    }

    #[test]
    fn resume_appends_version() {
        let target = WatchTarget::new("v1", "namespaces");
        let version = ResourceVersion::new("1234");
        assert!(target
            .path(Some(&version))
            .ends_with("&allowWatchBookmarks&resourceVersion=1234"));
        assert!(!target
            .path(Some(&ResourceVersion::empty()))
            .contains("resourceVersion"));
    }

    #[test]
    fn display_distinguishes_selectors() {
        let a = WatchTarget::new("v1", "configmaps").field("metadata.name", "a");
        let b = WatchTarget::new("v1", "configmaps").field("metadata.name", "b");
        assert_ne!(a.to_string(), b.to_string());
        assert_eq!(a.to_string(), "v1/configmaps[metadata.name=a]");
    }
}
