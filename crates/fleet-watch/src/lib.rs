//! # fleet-watch
//!
//! Long-poll watch adapter for control-plane resource APIs.
//!
//! One [`ResourceWatcher`] per [`WatchTarget`] keeps a watch connection open,
//! splits the body into lines, parses each line as a
//! [`WatchRecord`](fleet_core::WatchRecord) and hands it to a
//! [`RecordSink`](fleet_cache::RecordSink). Reconnection follows the rules of
//! the API server:
//!
//! | response | action |
//! |---|---|
//! | 200, body ends | resume at once from the last seen version |
//! | 403 | stop, the service account lacks permission |
//! | 404 | wait [`BackoffPolicy::not_found_delay`], the kind may not be installed yet |
//! | 429 | wait `Retry-After`, counts against the retry budget |
//! | 408, 5xx, network error | capped exponential backoff, bounded retries |
//! | anything else | capped exponential backoff |
//!
//! [`WatchManager`] runs one task per target and reports per-watch state.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod buffer;
mod manager;
mod target;
mod transport;
mod watcher;

pub use backoff::BackoffPolicy;
pub use buffer::LineBuffer;
pub use manager::WatchManager;
pub use target::WatchTarget;
pub use transport::{build_client, ByteStream, HttpTransport, WatchResponse, WatchTransport};
pub use watcher::{ResourceWatcher, WatchState};
