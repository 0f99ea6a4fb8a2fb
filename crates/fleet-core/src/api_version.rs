//! API group/version handling.
//!
//! Control-plane objects carry an `apiVersion` of the form `group/version`,
//! or a bare `version` for the core group. Watch paths and access reviews
//! both need the pieces.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An `apiVersion` string such as `cluster.open-cluster-management.io/v1` or `v1`.
///
/// # Example
///
/// ```rust
/// use fleet_core::ApiVersion;
///
/// let api = ApiVersion::new("hive.openshift.io/v1");
/// assert_eq!(api.group(), "hive.openshift.io");
/// assert_eq!(api.version(), "v1");
/// assert_eq!(api.api_root(), "/apis");
///
/// assert_eq!(ApiVersion::new("v1").api_root(), "/api");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiVersion(String);

impl ApiVersion {
    /// Create a new API version from a string.
    #[must_use]
    pub fn new(api_version: impl Into<String>) -> Self {
        Self(api_version.into())
    }

    /// Get the API version as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The API group, empty for the core group.
    #[must_use]
    pub fn group(&self) -> &str {
        match self.0.split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    /// The version part (`v1`, `v1beta1`, ...).
    #[must_use]
    pub fn version(&self) -> &str {
        match self.0.split_once('/') {
            Some((_, version)) => version,
            None => &self.0,
        }
    }

    /// Whether this is the legacy core group.
    #[must_use]
    pub fn is_core(&self) -> bool {
        !self.0.contains('/')
    }

    /// URL prefix for requests against this API version.
    #[must_use]
    pub fn api_root(&self) -> &'static str {
        if self.is_core() {
            "/api"
        } else {
            "/apis"
        }
    }

    /// Consume and return the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Plural resource name used by access reviews for a kind.
///
/// Mirrors the naive pluralisation the API server expects for the kinds the
/// service streams: lowercase plus a trailing `s`.
#[must_use]
pub fn resource_plural(kind: &str) -> String {
    let mut plural = kind.to_lowercase();
    plural.push('s');
    plural
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ApiVersion {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ApiVersion {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ApiVersion {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grouped_version() {
        let api = ApiVersion::new("policy.open-cluster-management.io/v1");
        assert_eq!(api.group(), "policy.open-cluster-management.io");
        assert_eq!(api.version(), "v1");
        assert!(!api.is_core());
    }

    #[test]
    fn test_core_version() {
        let api = ApiVersion::new("v1");
        assert_eq!(api.group(), "");
        assert_eq!(api.version(), "v1");
        assert!(api.is_core());
        assert_eq!(api.api_root(), "/api");
    }

    #[test]
    fn test_resource_plural() {
        assert_eq!(resource_plural("ManagedCluster"), "managedclusters");
        assert_eq!(resource_plural("Namespace"), "namespaces");
    }
}
