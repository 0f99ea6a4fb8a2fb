//! Graceful shutdown coordination.
//!
//! The [`ShutdownController`] is shared by the HTTP listener and the
//! background sweeps (keep-alive, session reaper, throttle purge, access cache
//! expiry). Triggering it flips a watch channel every task selects on, then
//! waits for registered operations to finish within a grace period.
//!
//! # Example
//!
//! ```rust
//! use fleet_server::shutdown::ShutdownController;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let controller = ShutdownController::new();
//! let signal = controller.shutdown_signal();
//!
//! let task = tokio::spawn(async move { signal.wait().await });
//!
//! assert!(controller.shutdown(Duration::from_secs(1)).await);
//! task.await.unwrap();
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{FleetError, FleetResult};
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::{info, warn};

/// Coordinates shutdown between the listener and background tasks.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug)]
struct ShutdownInner {
    initiated: AtomicBool,
    tx: watch::Sender<bool>,
    active_ops: AtomicUsize,
    idle: Notify,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    /// Create a controller that has not been triggered.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(ShutdownInner {
                initiated: AtomicBool::new(false),
                tx,
                active_ops: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Receiver that flips to `true` on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.tx.subscribe()
    }

    /// Whether shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        self.inner.initiated.load(Ordering::SeqCst)
    }

    /// A future-like handle resolving on shutdown.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.subscribe(),
        }
    }

    /// Trigger shutdown and wait up to `grace_period` for registered
    /// operations to finish.
    ///
    /// Returns `false` if the grace period ran out. A second call returns
    /// `true` immediately.
    pub async fn shutdown(&self, grace_period: Duration) -> bool {
        if self
            .inner
            .initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return true;
        }

        info!(grace_period = ?grace_period, "initiating graceful shutdown");
        self.inner.tx.send_replace(true);

        match timeout(grace_period, self.wait_for_completion()).await {
            Ok(()) => {
                info!("graceful shutdown completed");
                true
            }
            Err(_) => {
                warn!(
                    remaining_ops = self.active_operations(),
                    "graceful shutdown timed out"
                );
                false
            }
        }
    }

    async fn wait_for_completion(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.active_operations() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Register an operation that shutdown should wait for.
    pub fn register_operation(&self) -> OperationGuard {
        self.inner.active_ops.fetch_add(1, Ordering::SeqCst);
        OperationGuard {
            controller: self.clone(),
        }
    }

    /// Number of registered operations.
    pub fn active_operations(&self) -> usize {
        self.inner.active_ops.load(Ordering::SeqCst)
    }
}

/// Keeps an operation registered until dropped.
#[derive(Debug)]
pub struct OperationGuard {
    controller: ShutdownController,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if self.controller.inner.active_ops.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.controller.inner.idle.notify_waiters();
        }
    }
}

/// Resolves once shutdown is triggered.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait for shutdown. A dropped controller counts as shutdown.
    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C elsewhere).
pub async fn wait_for_signal() -> FleetResult<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| FleetError::internal("failed to install SIGTERM handler", e))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| FleetError::internal("failed to install SIGINT handler", e))?;

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| FleetError::internal("failed to install Ctrl+C handler", e))?;
        info!("received Ctrl+C");
    }

    Ok(())
}

/// Shutdown settings.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long to wait for in-flight work.
    pub grace_period: Duration,
    /// Whether the binary installs OS signal handlers.
    pub listen_for_signals: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            listen_for_signals: true,
        }
    }
}
