//! Health state behind `/livenessProbe` and `/readinessProbe`.
//!
//! Readiness flips on when the server starts serving and off when shutdown
//! begins. Liveness fails when any registered [`LivenessProbe`] reports a dead
//! component, which in practice means a watch that exhausted its retries.
//!
//! # Example
//!
//! ```rust
//! use fleet_server::health::HealthService;
//!
//! let health = HealthService::new();
//! assert!(!health.is_ready());
//! health.set_serving();
//! assert!(health.is_ready());
//! assert!(health.is_live());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fleet_watch::WatchManager;
use parking_lot::RwLock;

/// A component that can report itself dead.
pub trait LivenessProbe: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Whether the component still works.
    fn is_live(&self) -> bool;
}

impl LivenessProbe for WatchManager {
    fn name(&self) -> &str {
        "watches"
    }

    fn is_live(&self) -> bool {
        !self.any_failed()
    }
}

/// Shared readiness and liveness state. Cheap to clone.
#[derive(Clone, Default)]
pub struct HealthService {
    inner: Arc<HealthInner>,
}

#[derive(Default)]
struct HealthInner {
    serving: AtomicBool,
    probes: RwLock<Vec<Arc<dyn LivenessProbe>>>,
}

impl std::fmt::Debug for HealthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthService")
            .field("serving", &self.is_ready())
            .field("probes", &self.inner.probes.read().len())
            .finish()
    }
}

impl HealthService {
    /// Create a health state that is not yet serving.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the server as serving.
    pub fn set_serving(&self) {
        self.inner.serving.store(true, Ordering::SeqCst);
    }

    /// Mark the server as not serving (shutdown in progress).
    pub fn set_not_serving(&self) {
        self.inner.serving.store(false, Ordering::SeqCst);
    }

    /// Register a component whose failure makes the process unhealthy.
    pub fn add_probe(&self, probe: Arc<dyn LivenessProbe>) {
        self.inner.probes.write().push(probe);
    }

    /// Whether requests should be routed here.
    pub fn is_ready(&self) -> bool {
        self.inner.serving.load(Ordering::SeqCst)
    }

    /// Whether every registered component still works.
    pub fn is_live(&self) -> bool {
        self.failing().is_empty()
    }

    /// Names of the components reporting failure.
    pub fn failing(&self) -> Vec<String> {
        self.inner
            .probes
            .read()
            .iter()
            .filter(|probe| !probe.is_live())
            .map(|probe| probe.name().to_string())
            .collect()
    }
}

/// Health check settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Serve the probe endpoints.
    pub enabled: bool,
    /// Report ready as soon as the server is built.
    pub initial_serving: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_serving: true,
        }
    }
}
