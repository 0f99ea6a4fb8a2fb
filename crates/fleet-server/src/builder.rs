//! Server builder.

use std::sync::Arc;
use std::time::Duration;

use fleet_cache::ResourceCache;
use fleet_core::{FleetError, FleetResult, SharedClock, SystemClock};

use crate::auth::AccessReviewer;
use crate::config::{CompressionConfig, ServerConfig, SnapshotConfig};
use crate::connections::{ConnectionLimits, ConnectionTracker};
use crate::health::{HealthService, LivenessProbe};
use crate::metrics::FleetMetrics;
use crate::shutdown::ShutdownController;
use crate::FleetServer;

/// Builder for a [`FleetServer`].
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use async_trait::async_trait;
/// use fleet_cache::ResourceCache;
/// use fleet_core::FleetResult;
/// use fleet_server::{AccessReviewer, AccessTarget, FleetServerBuilder, Verb};
///
/// struct AllowAll;
///
/// #[async_trait]
/// impl AccessReviewer for AllowAll {
///     async fn review(&self, _: &str, _: &AccessTarget, _: Verb) -> FleetResult<bool> {
///         Ok(true)
///     }
/// }
///
/// let server = FleetServerBuilder::new()
///     .cache(Arc::new(ResourceCache::builder().build()))
///     .reviewer(Arc::new(AllowAll))
///     .disable_compression()
///     .build()
///     .unwrap();
/// assert!(!server.config().compression.enabled);
/// ```
#[derive(Default)]
pub struct FleetServerBuilder {
    cache: Option<Arc<ResourceCache>>,
    reviewer: Option<Arc<dyn AccessReviewer>>,
    clock: Option<SharedClock>,
    probes: Vec<Arc<dyn LivenessProbe>>,
    config: ServerConfig,
}

impl std::fmt::Debug for FleetServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetServerBuilder")
            .field("has_cache", &self.cache.is_some())
            .field("has_reviewer", &self.reviewer.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FleetServerBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the resource cache whose event log is streamed.
    ///
    /// This is required.
    pub fn cache(mut self, cache: Arc<ResourceCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the access reviewer.
    ///
    /// This is required.
    pub fn reviewer(mut self, reviewer: Arc<dyn AccessReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Set the time source for sweeps and TTLs.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Register a component checked by the liveness probe.
    pub fn liveness_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the keep-alive interval.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Set how long a drain loop may run before its session is reaped.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    /// Set how long access decisions are reused.
    pub fn access_ttl(mut self, ttl: Duration) -> Self {
        self.config.access_ttl = ttl;
        self
    }

    /// Set the kinds delivered without review.
    pub fn public_kinds(mut self, kinds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config.public_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Set the cookie carrying the bearer token.
    pub fn token_cookie(mut self, name: impl Into<String>) -> Self {
        self.config.token_cookie = name.into();
        self
    }

    /// Never compress streams.
    pub fn disable_compression(mut self) -> Self {
        self.config.compression = CompressionConfig::disabled();
        self
    }

    /// Set custom compression configuration.
    pub fn compression(mut self, config: CompressionConfig) -> Self {
        self.config.compression = config;
        self
    }

    /// Set snapshot packing.
    pub fn snapshot(mut self, config: SnapshotConfig) -> Self {
        self.config.snapshot = config;
        self
    }

    /// Set stream admission limits.
    pub fn limits(mut self, limits: ConnectionLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Set the shutdown grace period.
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.config.shutdown.grace_period = grace_period;
        self
    }

    /// Build the server.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No cache or no reviewer was provided
    /// - A sweep interval or the session timeout is zero
    pub fn build(self) -> FleetResult<FleetServer> {
        let cache = self
            .cache
            .ok_or_else(|| FleetError::Configuration("cache is required".into()))?;
        let reviewer = self
            .reviewer
            .ok_or_else(|| FleetError::Configuration("access reviewer is required".into()))?;

        let config = self.config;
        let intervals = [
            ("keepalive_interval", config.keepalive_interval),
            ("session_timeout", config.session_timeout),
            ("reaper_interval", config.reaper_interval),
            ("access_sweep_interval", config.access_sweep_interval),
            ("throttle_sweep_interval", config.throttle_sweep_interval),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(FleetError::Configuration(format!("{name} must be non-zero")));
        }

        let health = HealthService::new();
        for probe in self.probes {
            health.add_probe(probe);
        }

        Ok(FleetServer {
            connections: ConnectionTracker::new(config.limits.clone()),
            config: Arc::new(config),
            cache,
            reviewer,
            clock: self.clock.unwrap_or_else(SystemClock::shared),
            metrics: FleetMetrics::new(),
            health,
            shutdown: ShutdownController::new(),
        })
    }
}
