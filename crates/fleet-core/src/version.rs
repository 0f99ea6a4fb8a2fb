//! Resource version tracking.
//!
//! This module provides [`ResourceVersion`], the opaque version token the API
//! server attaches to every object. Versions are used to drop re-delivered
//! records and to resume a watch where it left off.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Version identifier for control-plane resources.
///
/// `ResourceVersion` wraps the server supplied string. Equality is always
/// meaningful; ordering is only defined when both sides are plain integers,
/// which is what the API server hands out in practice.
///
/// # Example
///
/// ```rust
/// use fleet_core::ResourceVersion;
///
/// let v1 = ResourceVersion::new("100");
/// let v2 = ResourceVersion::new("101");
///
/// assert!(v2.is_newer_than(&v1));
/// assert!(!v1.is_newer_than(&v1));
/// assert!(!ResourceVersion::empty().is_newer_than(&v1));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    /// Create a new resource version from a string.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// Create an empty resource version (initial state).
    #[must_use]
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Check if the version is empty (initial state).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Get the version as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Compare two versions when both are numeric.
    ///
    /// Returns `None` when either side is not an integer, in which case the
    /// versions can only be compared for equality.
    #[must_use]
    pub fn numeric_cmp(&self, other: &Self) -> Option<Ordering> {
        let lhs = self.0.parse::<u64>().ok()?;
        let rhs = other.0.parse::<u64>().ok()?;
        Some(lhs.cmp(&rhs))
    }

    /// True only when both versions are numeric and `self` is strictly greater.
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.numeric_cmp(other) == Some(Ordering::Greater)
    }

    /// True only when both versions are numeric and `self` is strictly smaller.
    #[must_use]
    pub fn is_older_than(&self, other: &Self) -> bool {
        self.numeric_cmp(other) == Some(Ordering::Less)
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ResourceVersion {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ResourceVersion {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<ResourceVersion> for String {
    fn from(v: ResourceVersion) -> Self {
        v.0
    }
}

impl AsRef<str> for ResourceVersion {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
