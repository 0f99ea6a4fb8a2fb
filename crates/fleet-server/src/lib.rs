//! # fleet-server
//!
//! Server-sent event stream of cached fleet resources.
//!
//! This crate provides the client-facing layer of fleet-events:
//!
//! - [`FleetServer`] - Server type owning configuration and shared state
//! - [`FleetServerBuilder`] - Builder for configuring the server
//! - [`ServerHandle`] - A started server: router, background sweeps, disposal
//! - Per-session authorization through self subject access reviews
//! - gzip/deflate stream compression with per-frame flushing
//! - Snapshot packing so summary data reaches the client first
//! - Liveness and readiness probes, metrics, graceful shutdown
//!
//! ## Example
//!
//! ```rust,ignore
//! use fleet_server::{FleetServerBuilder, SelfSubjectAccessReviewer};
//! use fleet_cache::ResourceCache;
//! use std::sync::Arc;
//!
//! let cache = Arc::new(ResourceCache::builder().build());
//! let reviewer = SelfSubjectAccessReviewer::new(client, "https://api.hub:6443");
//! let server = FleetServerBuilder::new()
//!     .cache(Arc::clone(&cache))
//!     .reviewer(Arc::new(reviewer))
//!     .build()?;
//!
//! let handle = server.start()?;
//! handle.serve("0.0.0.0:4010".parse()?).await?;
//! ```
//!
//! ## Lifecycle
//!
//! [`FleetServer::start`] attaches the session registry to the cache's event
//! log and spawns four periodic tasks on the current runtime:
//!
//! | task | default period | action |
//! |---|---|---|
//! | keep-alive | 10s | write `:` comments to idle sessions |
//! | reaper | 60s | close sessions whose drain loop is stuck |
//! | throttle sweep | 5s | release or drop throttled policy reports |
//! | access sweep | 60s | drop expired access decisions |
//!
//! [`ServerHandle::dispose`] stops them, closes every session and detaches
//! the registry.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
mod builder;
mod config;
pub mod connections;
pub mod encoder;
pub mod health;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod shutdown;
pub mod snapshot;

pub use auth::{
    AccessCache, AccessReviewer, AccessTarget, Authorizer, SelfSubjectAccessReviewer, Verb,
};
pub use builder::FleetServerBuilder;
pub use config::{
    CompressionConfig, ServerConfig, SnapshotConfig, DEFAULT_SESSION_COOKIE, DEFAULT_TOKEN_COOKIE,
};
pub use connections::{ConnectionGuard, ConnectionLimits, ConnectionTracker};
pub use encoder::{Encoding, StreamEncoder};
pub use health::{HealthConfig, HealthService, LivenessProbe};
pub use metrics::FleetMetrics;
pub use registry::SessionRegistry;
pub use session::{ChannelSink, FrameSink, Session, SessionFilter, SessionId};
pub use shutdown::{ShutdownConfig, ShutdownController};
pub use snapshot::SnapshotPlanner;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleet_cache::{EventListener, ResourceCache};
use fleet_core::{FleetError, FleetResult, SharedClock};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::http::AppState;

/// The event stream server.
///
/// Holds configuration and the state shared by every started instance.
/// Call [`start`](Self::start) to attach to the cache and obtain a
/// [`ServerHandle`].
pub struct FleetServer {
    config: Arc<ServerConfig>,
    cache: Arc<ResourceCache>,
    reviewer: Arc<dyn AccessReviewer>,
    clock: SharedClock,
    metrics: FleetMetrics,
    health: HealthService,
    connections: ConnectionTracker,
    shutdown: ShutdownController,
}

impl std::fmt::Debug for FleetServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetServer")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

impl FleetServer {
    /// Create a new builder for configuring the server.
    pub fn builder() -> FleetServerBuilder {
        FleetServerBuilder::new()
    }

    /// Get the server configuration.
    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get a reference to the cache.
    #[inline]
    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Get the metrics recorder.
    #[inline]
    pub fn metrics(&self) -> &FleetMetrics {
        &self.metrics
    }

    /// Get the probe state.
    #[inline]
    pub fn health(&self) -> &HealthService {
        &self.health
    }

    /// Get the connection tracker.
    #[inline]
    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    /// Get the shutdown controller.
    #[inline]
    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.shutdown
    }

    /// Attach to the cache's event log and start the background sweeps.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no runtime is available.
    pub fn start(&self) -> FleetResult<ServerHandle> {
        let config = Arc::clone(&self.config);
        let access = AccessCache::new(
            Arc::clone(&self.reviewer),
            config.access_ttl,
            Arc::clone(&self.clock),
            self.metrics.clone(),
        );
        let authorizer = Arc::new(Authorizer::new(access, config.public_kinds.clone()));
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(self.cache.event_log()),
            Arc::clone(&authorizer),
            SnapshotPlanner::new(config.snapshot.clone()),
            Arc::clone(&self.clock),
            self.metrics.clone(),
            config.session_timeout,
        )?);
        self.cache
            .event_log()
            .set_listener(Arc::clone(&registry) as Arc<dyn EventListener>);

        let mut tasks = Vec::with_capacity(4);
        {
            let registry = Arc::clone(&registry);
            tasks.push(self.spawn_periodic("keepalive", config.keepalive_interval, move || {
                let (written, skipped) = registry.keepalive();
                trace!(written, skipped, "keep-alive sent");
            }));
        }
        {
            let registry = Arc::clone(&registry);
            tasks.push(self.spawn_periodic("reaper", config.reaper_interval, move || {
                let reaped = registry.reap();
                if reaped > 0 {
                    info!(reaped, "reaped stuck sessions");
                }
            }));
        }
        {
            let cache = Arc::clone(&self.cache);
            tasks.push(self.spawn_periodic(
                "throttle-sweep",
                config.throttle_sweep_interval,
                move || {
                    let released = cache.sweep_throttle();
                    if released > 0 {
                        debug!(released, "throttle swept");
                    }
                },
            ));
        }
        {
            let authorizer = Arc::clone(&authorizer);
            tasks.push(self.spawn_periodic(
                "access-sweep",
                config.access_sweep_interval,
                move || {
                    let expired = authorizer.cache().sweep();
                    trace!(expired, "access decisions swept");
                },
            ));
        }

        if config.health.initial_serving {
            self.health.set_serving();
        } else {
            self.health.set_not_serving();
        }
        info!(
            keepalive = ?config.keepalive_interval,
            session_timeout = ?config.session_timeout,
            compression = config.compression.enabled,
            "event stream server started"
        );

        Ok(ServerHandle {
            state: AppState {
                registry,
                connections: self.connections.clone(),
                health: self.health.clone(),
                shutdown: self.shutdown.clone(),
                config,
            },
            cache: Arc::clone(&self.cache),
            tasks: Mutex::new(tasks),
        })
    }

    fn spawn_periodic<F>(&self, name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() + Send + 'static,
    {
        let guard = self.shutdown.register_operation();
        let signal = self.shutdown.shutdown_signal();
        tokio::spawn(async move {
            let _guard = guard;
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            let stop = signal.wait();
            tokio::pin!(stop);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = interval.tick() => tick(),
                }
            }
            debug!(task = name, "background task stopped");
        })
    }
}

/// A started [`FleetServer`].
pub struct ServerHandle {
    state: AppState,
    cache: Arc<ResourceCache>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("sessions", &self.state.registry.len())
            .field("tasks", &self.tasks.lock().len())
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    /// Connected sessions.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.state.registry
    }

    /// The HTTP router serving `/events` and the probes.
    pub fn router(&self) -> axum::Router {
        http::router(self.state.clone())
    }

    /// Bind `addr` and serve until shutdown is triggered.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or the listener fails.
    pub async fn serve(&self, addr: SocketAddr) -> FleetResult<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FleetError::transport(format!("failed to bind {addr}"), e))?;
        self.serve_with_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown is triggered.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener fails.
    pub async fn serve_with_listener(&self, listener: TcpListener) -> FleetResult<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| FleetError::transport("listener has no local address", e))?;
        info!(addr = %addr, "event stream server listening");

        let signal = self.state.shutdown.shutdown_signal();
        let registry = Arc::clone(&self.state.registry);
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            signal.wait().await;
            // Open streams never end by themselves.
            registry.close_all();
        })
        .await
        .map_err(|e| FleetError::transport("event stream server failed", e))
    }

    /// Stop accepting streams, close every session, detach from the event log
    /// and stop the background sweeps.
    ///
    /// Returns `true` if the sweeps stopped within `grace_period`.
    pub async fn dispose(&self, grace_period: Duration) -> bool {
        self.state.health.set_not_serving();
        let stopped = self.state.shutdown.shutdown(grace_period).await;
        self.state.registry.close_all();
        self.cache.event_log().clear_listener();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(clean = stopped, "event stream server disposed");
        stopped
    }
}
