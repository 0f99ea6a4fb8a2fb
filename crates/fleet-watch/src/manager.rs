//! Watch task management.
//!
//! The manager owns one spawned task per [`WatchTarget`] and the abort handle
//! for it. Per-watch state is exposed for the liveness probe.

use std::sync::Arc;

use dashmap::DashMap;
use fleet_cache::RecordSink;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::target::WatchTarget;
use crate::transport::WatchTransport;
use crate::watcher::{ResourceWatcher, WatchState};

#[derive(Debug)]
struct WatchEntry {
    state: watch::Receiver<WatchState>,
    handle: JoinHandle<()>,
}

/// Runs and tracks the set of watches.
pub struct WatchManager {
    transport: Arc<dyn WatchTransport>,
    sink: Arc<dyn RecordSink>,
    policy: BackoffPolicy,
    watches: DashMap<String, WatchEntry>,
}

impl std::fmt::Debug for WatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchManager")
            .field("watches", &self.watches.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl WatchManager {
    /// Create a manager; no watch is started yet.
    pub fn new(
        transport: Arc<dyn WatchTransport>,
        sink: Arc<dyn RecordSink>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            transport,
            sink,
            policy,
            watches: DashMap::new(),
        }
    }

    /// Start watching `target`. Returns `false` if it is already watched.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn watch(&self, target: WatchTarget) -> bool {
        let name = target.to_string();
        if self.watches.contains_key(&name) {
            warn!(target = %name, "already watching");
            return false;
        }

        let watcher = ResourceWatcher::new(
            target,
            Arc::clone(&self.transport),
            Arc::clone(&self.sink),
            self.policy,
        );
        let state = watcher.state();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            match watcher.run().await {
                Ok(()) => info!(target = %task_name, "watch finished"),
                Err(e) => error!(target = %task_name, error = %e, "watch stopped"),
            }
        });

        self.watches.insert(name, WatchEntry { state, handle });
        true
    }

    /// Start every target in `targets`.
    pub fn watch_all(&self, targets: impl IntoIterator<Item = WatchTarget>) {
        for target in targets {
            self.watch(target);
        }
    }

    /// Number of watches.
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    /// Whether nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// State of one watch.
    pub fn state(&self, target: &WatchTarget) -> Option<WatchState> {
        self.watches
            .get(&target.to_string())
            .map(|entry| *entry.state.borrow())
    }

    /// State of every watch, sorted by name.
    pub fn states(&self) -> Vec<(String, WatchState)> {
        let mut states: Vec<_> = self
            .watches
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value().state.borrow()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Whether any watch gave up after exhausting its retries.
    pub fn any_failed(&self) -> bool {
        self.watches
            .iter()
            .any(|entry| *entry.value().state.borrow() == WatchState::Failed)
    }

    /// Stop one watch.
    pub fn stop(&self, target: &WatchTarget) -> bool {
        match self.watches.remove(&target.to_string()) {
            Some((_, entry)) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stop every watch.
    pub fn stop_all(&self) {
        let names: Vec<String> = self.watches.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, entry)) = self.watches.remove(&name) {
                entry.handle.abort();
            }
        }
        info!("stopped all watches");
    }
}

impl Drop for WatchManager {
    fn drop(&mut self) {
        for entry in self.watches.iter() {
            entry.value().handle.abort();
        }
    }
}
