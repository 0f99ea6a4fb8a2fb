//! # fleet-cache
//!
//! State layer of the fleet-events stream service.
//!
//! This crate holds everything between the upstream watches and the client
//! sessions:
//!
//! - [`ResourceCache`] - Latest known state per resource identity, deduplicated by version
//! - [`EventLog`] - Monotonic log of outbound events with a broadcast hook
//! - [`ComplianceThrottle`] - Debouncer for the oscillating compliance kind
//! - [`synthetic`] - Generated fleet data for load testing
//!
//! ## Key Design Decisions
//!
//! - The event log lock is held while an event is handed to the listener, so a
//!   session registering under the same lock sees every event exactly once
//! - Locks are `parking_lot` mutexes held only for in-memory work, never across `.await`
//! - Deleted resources are kept as tombstones, never hard-removed
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use fleet_cache::{EventLog, ResourceCache};
//! use fleet_core::WatchRecord;
//!
//! let log = Arc::new(EventLog::new());
//! let cache = ResourceCache::builder().event_log(Arc::clone(&log)).build();
//!
//! let line = br#"{"type":"ADDED","object":{"kind":"Namespace","apiVersion":"v1","metadata":{"name":"default","resourceVersion":"1"}}}"#;
//! cache.apply(WatchRecord::from_line(line).unwrap());
//!
//! assert_eq!(cache.resources("Namespace", "v1").len(), 1);
//! // START, the namespace, LOADED
//! assert_eq!(log.len(), 3);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod event_log;
mod stats;
pub mod synthetic;
mod throttle;

pub use cache::{CacheBuilder, RecordSink, ResourceCache};
pub use event_log::{EventListener, EventLog};
pub use stats::CacheStats;
pub use throttle::{
    settle, ComplianceState, ComplianceThrottle, ThrottleConfig, ThrottleDecision,
};
