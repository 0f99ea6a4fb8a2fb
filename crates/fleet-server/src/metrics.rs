//! Metrics for the event stream server.
//!
//! Recorded through the `metrics` facade; the binary decides which exporter,
//! if any, is installed.
//!
//! - Session lifecycle (opened, closed, active, duration)
//! - Frames delivered and suppressed by authorization
//! - Backpressure waits and keep-alives
//! - Access review calls, split into cached and uncached
//!
//! # Example
//!
//! ```rust
//! use fleet_server::metrics::FleetMetrics;
//!
//! let metrics = FleetMetrics::new();
//! metrics.frame_delivered("MODIFIED", 312);
//! metrics.frame_suppressed("ManagedCluster");
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Server metrics handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FleetMetrics {
    inner: Arc<FleetMetricsInner>,
}

#[derive(Debug)]
struct FleetMetricsInner {
    active_sessions: AtomicU64,
}

impl Default for FleetMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetMetrics {
    /// Create a new metrics handle.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FleetMetricsInner {
                active_sessions: AtomicU64::new(0),
            }),
        }
    }

    /// Record a session registration.
    pub fn session_opened(&self, encoding: &'static str) {
        let count = self.inner.active_sessions.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("fleet_sessions_opened_total", "encoding" => encoding).increment(1);
        gauge!("fleet_active_sessions").set(count as f64);
    }

    /// Record a session removal. `reason` is `closed` or `reaped`.
    pub fn session_closed(&self, reason: &'static str, duration: Duration) {
        let count = self
            .inner
            .active_sessions
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        counter!("fleet_sessions_closed_total", "reason" => reason).increment(1);
        gauge!("fleet_active_sessions").set(count as f64);
        histogram!("fleet_session_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a frame written to a session.
    pub fn frame_delivered(&self, event_type: &'static str, bytes: usize) {
        counter!("fleet_frames_delivered_total", "type" => event_type).increment(1);
        counter!("fleet_frame_bytes_total").increment(bytes as u64);
    }

    /// Record an event withheld from a session by the authorization filter.
    pub fn frame_suppressed(&self, kind: &str) {
        counter!("fleet_frames_suppressed_total", "kind" => kind.to_string()).increment(1);
    }

    /// Record a drain loop suspended on a full sink.
    pub fn backpressure(&self) {
        counter!("fleet_session_backpressure_total").increment(1);
    }

    /// Record one keep-alive pass.
    pub fn keepalive(&self, written: usize, skipped: usize) {
        counter!("fleet_keepalives_written_total").increment(written as u64);
        counter!("fleet_keepalives_skipped_total").increment(skipped as u64);
    }

    /// Record an event appended to the log.
    pub fn event_pushed(&self, event_type: &'static str) {
        counter!("fleet_events_pushed_total", "type" => event_type).increment(1);
    }

    /// Record an access decision served from the cache.
    pub fn access_cached(&self) {
        counter!("fleet_access_checks_total", "source" => "cached").increment(1);
    }

    /// Record an access review sent to the backend.
    pub fn access_reviewed(&self, verb: &'static str, latency: Duration) {
        counter!("fleet_access_checks_total", "source" => "uncached").increment(1);
        histogram!("fleet_access_review_seconds", "verb" => verb).record(latency.as_secs_f64());
    }

    /// Record a failed access review.
    pub fn access_failed(&self) {
        counter!("fleet_access_review_errors_total").increment(1);
    }

    /// Number of registered sessions.
    pub fn active_sessions(&self) -> u64 {
        self.inner.active_sessions.load(Ordering::Relaxed)
    }
}

/// Records session duration when dropped.
#[derive(Debug)]
pub struct SessionTracker {
    start: Instant,
    reason: &'static str,
    metrics: FleetMetrics,
}

impl SessionTracker {
    /// Count a session as opened.
    pub fn new(metrics: FleetMetrics, encoding: &'static str) -> Self {
        metrics.session_opened(encoding);
        Self {
            start: Instant::now(),
            reason: "closed",
            metrics,
        }
    }

    /// Record the session as removed by the reaper.
    pub fn mark_reaped(&mut self) {
        self.reason = "reaped";
    }
}

impl Drop for SessionTracker {
    fn drop(&mut self) {
        self.metrics
            .session_closed(self.reason, self.start.elapsed());
    }
}
