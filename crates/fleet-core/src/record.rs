//! Watch stream records.
//!
//! A watch response body is a sequence of newline separated JSON documents,
//! each one a [`WatchRecord`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FleetError;
use crate::resource::Resource;
use crate::version::ResourceVersion;
use crate::Result;

/// Status code the API server uses when the requested version is too old.
const GONE: u16 = 410;

/// One record of a watch stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchRecord {
    /// Object created, or listed on an initial watch.
    Added(Resource),
    /// Object changed.
    Modified(Resource),
    /// Object removed.
    Deleted(Resource),
    /// Progress marker carrying only a resource version.
    Bookmark(Resource),
    /// Server side error on the watch.
    Error(WatchStatus),
}

/// Status object carried by an `ERROR` record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchStatus {
    /// HTTP like status code.
    #[serde(default)]
    pub code: Option<u16>,
    /// Machine readable reason.
    #[serde(default)]
    pub reason: Option<String>,
    /// Human readable message.
    #[serde(default)]
    pub message: Option<String>,
    /// Remaining fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WatchRecord {
    /// Parse a single line of a watch stream.
    pub fn from_line(line: &[u8]) -> Result<Self> {
        serde_json::from_slice(line).map_err(|e| FleetError::decode("watch stream", &e))
    }

    /// The wire name of this record type.
    pub fn type_name(&self) -> &'static str {
        match self {
            WatchRecord::Added(_) => "ADDED",
            WatchRecord::Modified(_) => "MODIFIED",
            WatchRecord::Deleted(_) => "DELETED",
            WatchRecord::Bookmark(_) => "BOOKMARK",
            WatchRecord::Error(_) => "ERROR",
        }
    }

    /// The carried resource, for every type except `ERROR`.
    pub fn resource(&self) -> Option<&Resource> {
        match self {
            WatchRecord::Added(r)
            | WatchRecord::Modified(r)
            | WatchRecord::Deleted(r)
            | WatchRecord::Bookmark(r) => Some(r),
            WatchRecord::Error(_) => None,
        }
    }

    /// Version this record moves the watch to, if any.
    pub fn resource_version(&self) -> Option<&ResourceVersion> {
        self.resource().and_then(Resource::resource_version)
    }

    /// Whether this is an `ERROR` telling the watcher its version expired.
    pub fn is_expired(&self) -> bool {
        matches!(self, WatchRecord::Error(status) if status.code == Some(GONE))
    }
}
