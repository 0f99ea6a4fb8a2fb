//! Stream admission limits.
//!
//! Every `/events` request takes a slot from the [`ConnectionTracker`] before a
//! session is registered. The slot is held by a [`ConnectionGuard`] that lives
//! as long as the response body, so a closed socket frees it.
//!
//! # Example
//!
//! ```rust
//! use fleet_server::connections::{ConnectionLimits, ConnectionTracker};
//!
//! let tracker = ConnectionTracker::new(ConnectionLimits::new(1000, 100));
//!
//! match tracker.try_acquire(None) {
//!     Some(_guard) => { /* register the session */ }
//!     None => { /* answer 503 */ }
//! }
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, warn};

/// Limits on concurrent event streams.
#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    /// Maximum open streams.
    pub max_connections: u64,
    /// Maximum open streams per client IP address.
    pub max_per_ip: u64,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_per_ip: 100,
        }
    }
}

impl ConnectionLimits {
    /// Create new limits.
    pub fn new(max_connections: u64, max_per_ip: u64) -> Self {
        Self {
            max_connections,
            max_per_ip,
        }
    }
}

/// An admitted stream.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Slot ID.
    pub id: u64,
    /// Remote address, when the listener exposes it.
    pub remote_addr: Option<SocketAddr>,
    /// When the stream was admitted.
    pub connected_at: Instant,
}

/// Counts open streams and enforces [`ConnectionLimits`].
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    inner: Arc<ConnectionTrackerInner>,
}

#[derive(Debug)]
struct ConnectionTrackerInner {
    limits: ConnectionLimits,
    next_id: AtomicU64,
    active: AtomicU64,
    per_ip: RwLock<HashMap<IpAddr, u64>>,
    connections: RwLock<HashMap<u64, ConnectionInfo>>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new(ConnectionLimits::default())
    }
}

impl ConnectionTracker {
    /// Create a tracker with the given limits.
    pub fn new(limits: ConnectionLimits) -> Self {
        Self {
            inner: Arc::new(ConnectionTrackerInner {
                limits,
                next_id: AtomicU64::new(1),
                active: AtomicU64::new(0),
                per_ip: RwLock::new(HashMap::new()),
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// The configured limits.
    pub fn limits(&self) -> &ConnectionLimits {
        &self.inner.limits
    }

    /// Number of open streams.
    pub fn active_connections(&self) -> u64 {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// Number of open streams from `ip`.
    pub fn connections_for_ip(&self, ip: IpAddr) -> u64 {
        self.inner.per_ip.read().get(&ip).copied().unwrap_or(0)
    }

    /// Take a slot, or `None` when a limit is reached.
    pub fn try_acquire(&self, remote_addr: Option<SocketAddr>) -> Option<ConnectionGuard> {
        let current = self.inner.active.load(Ordering::Relaxed);
        if current >= self.inner.limits.max_connections {
            warn!(
                current,
                limit = self.inner.limits.max_connections,
                "stream rejected: at max connections"
            );
            return None;
        }

        if let Some(addr) = remote_addr {
            let ip = addr.ip();
            let mut per_ip = self.inner.per_ip.write();
            let ip_count = per_ip.get(&ip).copied().unwrap_or(0);
            if ip_count >= self.inner.limits.max_per_ip {
                warn!(
                    ip = %ip,
                    current = ip_count,
                    limit = self.inner.limits.max_per_ip,
                    "stream rejected: at max per-IP limit"
                );
                return None;
            }
            *per_ip.entry(ip).or_insert(0) += 1;
        }

        self.inner.active.fetch_add(1, Ordering::Relaxed);

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.connections.write().insert(
            id,
            ConnectionInfo {
                id,
                remote_addr,
                connected_at: Instant::now(),
            },
        );

        debug!(
            id,
            remote_addr = ?remote_addr,
            active = self.active_connections(),
            "stream admitted"
        );

        Some(ConnectionGuard {
            tracker: self.clone(),
            id,
            remote_addr,
        })
    }

    /// All open streams.
    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.inner.connections.read().values().cloned().collect()
    }

    fn release(&self, id: u64, remote_addr: Option<SocketAddr>) {
        self.inner.active.fetch_sub(1, Ordering::Relaxed);

        if let Some(addr) = remote_addr {
            let ip = addr.ip();
            let mut per_ip = self.inner.per_ip.write();
            if let Some(count) = per_ip.get_mut(&ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    per_ip.remove(&ip);
                }
            }
        }

        self.inner.connections.write().remove(&id);

        debug!(
            id,
            remote_addr = ?remote_addr,
            active = self.active_connections(),
            "stream released"
        );
    }
}

/// Holds an admission slot; releases it on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    id: u64,
    remote_addr: Option<SocketAddr>,
}

impl ConnectionGuard {
    /// Slot ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.release(self.id, self.remote_addr);
    }
}
