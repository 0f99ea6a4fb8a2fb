//! # fleet-events
//!
//! Live event stream of multi-cluster fleet resources for web consoles.
//!
//! The service watches the hub's resource APIs, keeps the latest state of
//! every object in memory and republishes changes to every connected browser
//! as a server-sent event stream, filtered by what each user may see.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fleet_events::prelude::*;
//! use std::sync::Arc;
//!
//! let cache = Arc::new(ResourceCache::builder().throttle(ThrottleConfig::default()).build());
//! let manager = Arc::new(WatchManager::new(transport, cache.clone(), BackoffPolicy::default()));
//! manager.watch_all(default_targets());
//!
//! let server = FleetServer::builder()
//!     .cache(cache)
//!     .reviewer(Arc::new(SelfSubjectAccessReviewer::new(client, api_url)))
//!     .liveness_probe(manager)
//!     .build()?;
//! server.start()?.serve("0.0.0.0:4010".parse()?).await?;
//! ```
//!
//! ## Architecture
//!
//! This library is organized into several crates:
//!
//! - `fleet-core` - Resource, record and event types, error handling, clocks
//! - `fleet-cache` - Resource cache, event log, compliance throttle
//! - `fleet-watch` - Long-poll watches with reconnection
//! - `fleet-server` - Sessions, authorization, compression, HTTP surface
//!
//! This crate re-exports all public APIs for convenience and ships the
//! `fleet-events` binary.
//!
//! ## Design Principles
//!
//! 1. **No panics in library code** - All errors are returned as `Result`
//! 2. **No locks held across await points** - Short `parking_lot` sections and `DashMap`
//! 3. **Typed identities** - `ResourceKey`, `EventId`, `SessionId`
//! 4. **Observable** - Built-in metrics and tracing support

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod watch_list;

// Re-export all sub-crates
pub use fleet_cache as cache;
pub use fleet_core as core;
pub use fleet_server as server;
pub use fleet_watch as watch;

/// Prelude module for convenient imports.
///
/// ```rust
/// use fleet_events::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use fleet_core::{
        ApiVersion, Event, EventData, EventId, FleetError, FleetResult, Resource, ResourceKey,
        ResourceVersion, WatchRecord,
    };

    // Cache types
    pub use fleet_cache::{CacheStats, EventLog, ResourceCache, ThrottleConfig};

    // Watch types
    pub use fleet_watch::{
        BackoffPolicy, HttpTransport, WatchManager, WatchResponse, WatchTarget, WatchTransport,
    };

    // Server types
    pub use fleet_server::{
        AccessReviewer, AccessTarget, ChannelSink, CompressionConfig, Encoding, FleetServer,
        FleetServerBuilder, SelfSubjectAccessReviewer, ServerConfig, ServerHandle, SessionFilter,
        SessionId, StreamEncoder, Verb,
    };

    pub use crate::watch_list::{default_targets, WatchConfig};
}

/// Version information for this crate.
pub mod version {
    /// Crate version.
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");

    /// Minimum supported Rust version.
    pub const MSRV: &str = "1.75";

    /// Get version info as a string.
    pub fn version_string() -> String {
        format!("fleet-events {} (MSRV {})", VERSION, MSRV)
    }
}
