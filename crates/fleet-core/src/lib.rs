//! # fleet-core
//!
//! Core types, traits, and error handling for the fleet-events stream service.
//!
//! This crate provides the foundational types used across all other crates:
//!
//! - [`FleetError`] - Error type with HTTP status code mapping
//! - [`Resource`] / [`ResourceKey`] - Normalized control-plane objects and their identity
//! - [`ResourceVersion`] - Opaque version token attached by the API server
//! - [`WatchRecord`] - One line of a watch stream
//! - [`Event`] / [`EventData`] - Outbound stream events
//! - [`Clock`] - Injectable time source for sweeps and TTLs
//!
//! ## Example
//!
//! ```rust
//! use fleet_core::{WatchRecord, ResourceVersion};
//!
//! let line = br#"{"type":"ADDED","object":{"kind":"ManagedCluster","apiVersion":"cluster.open-cluster-management.io/v1","metadata":{"name":"local-cluster","resourceVersion":"42"}}}"#;
//! let record = WatchRecord::from_line(line).unwrap();
//!
//! let resource = record.resource().unwrap();
//! assert_eq!(resource.metadata.resource_version, Some(ResourceVersion::new("42")));
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod api_version;
mod clock;
mod error;
mod event;
mod record;
mod resource;
mod version;

pub use api_version::{resource_plural, ApiVersion};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::FleetError;
pub use event::{Event, EventData, EventId};
pub use record::{WatchRecord, WatchStatus};
pub use resource::{ObjectMeta, Resource, ResourceKey};
pub use version::ResourceVersion;

/// Result type alias using [`FleetError`].
pub type Result<T> = std::result::Result<T, FleetError>;

/// Alias for Result, used by the downstream crates.
pub type FleetResult<T> = Result<T>;
