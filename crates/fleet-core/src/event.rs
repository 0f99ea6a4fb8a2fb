//! Outbound stream events.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resource::Resource;

/// Monotonic identifier of an event in the log.
///
/// Rendered on the wire as a decimal string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(u64);

impl EventId {
    /// Create an event id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload of an event, serialized as the frame's `data:` JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventData {
    /// Stream start; clients reset their state.
    Start,
    /// Initial content fully delivered.
    Loaded,
    /// End of a snapshot packet.
    Eop,
    /// Live configuration for the frontend.
    Settings {
        /// Key/value settings.
        settings: BTreeMap<String, String>,
    },
    /// Object created.
    Added {
        /// The object.
        object: Resource,
    },
    /// Object changed.
    Modified {
        /// The object.
        object: Resource,
    },
    /// Object removed; carries the minimal tombstone.
    Deleted {
        /// The tombstone.
        object: Resource,
    },
}

impl EventData {
    /// Control events carry no resource and bypass filtering.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            EventData::Start | EventData::Loaded | EventData::Eop | EventData::Settings { .. }
        )
    }

    /// The carried object, if any.
    pub fn resource(&self) -> Option<&Resource> {
        match self {
            EventData::Added { object }
            | EventData::Modified { object }
            | EventData::Deleted { object } => Some(object),
            _ => None,
        }
    }

    /// The wire name of the event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventData::Start => "START",
            EventData::Loaded => "LOADED",
            EventData::Eop => "EOP",
            EventData::Settings { .. } => "SETTINGS",
            EventData::Added { .. } => "ADDED",
            EventData::Modified { .. } => "MODIFIED",
            EventData::Deleted { .. } => "DELETED",
        }
    }
}

/// An event in the log.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// Position in the log.
    pub id: EventId,
    /// Optional SSE `event:` name.
    pub name: Option<String>,
    /// Namespace of the carried object, used by subscription filters.
    pub namespace: Option<String>,
    /// Payload.
    pub data: EventData,
}

impl Event {
    /// Create an event, taking the namespace from the carried object.
    pub fn new(id: EventId, data: EventData) -> Self {
        let namespace = data
            .resource()
            .and_then(Resource::namespace)
            .map(str::to_string);
        Self {
            id,
            name: None,
            namespace,
            data,
        }
    }

    /// Set the SSE event name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Kind of the carried object.
    pub fn kind(&self) -> Option<&str> {
        self.data.resource().map(|r| r.kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_serialization() {
        assert_eq!(
            serde_json::to_value(EventData::Start).unwrap(),
            json!({"type": "START"})
        );
        let mut settings = BTreeMap::new();
        settings.insert("LOG_LEVEL".to_string(), "info".to_string());
        assert_eq!(
            serde_json::to_value(EventData::Settings { settings }).unwrap(),
            json!({"type": "SETTINGS", "settings": {"LOG_LEVEL": "info"}})
        );
    }

    #[test]
    fn test_object_serialization() {
        let object = Resource::new("Policy", "v1", Some("ns".into()), "p");
        let value = serde_json::to_value(EventData::Added { object }).unwrap();
        assert_eq!(value["type"], "ADDED");
        assert_eq!(value["object"]["metadata"]["name"], "p");
    }

    #[test]
    fn test_event_namespace_from_object() {
        let object = Resource::new("Policy", "v1", Some("ns".into()), "p");
        let event = Event::new(EventId::new(3), EventData::Modified { object });
        assert_eq!(event.namespace.as_deref(), Some("ns"));
        assert_eq!(event.kind(), Some("Policy"));
        assert!(!event.data.is_control());

        let control = Event::new(EventId::new(1), EventData::Start);
        assert_eq!(control.namespace, None);
        assert!(control.data.is_control());
    }

    #[test]
    fn test_event_id_renders_decimal() {
        assert_eq!(EventId::new(42).to_string(), "42");
        assert!(EventId::new(2) > EventId::new(1));
    }
}
