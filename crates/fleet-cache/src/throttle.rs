//! Compliance throttle.
//!
//! Policies report a `status.compliant` that can flip between states many
//! times a second when a managed cluster is struggling. The throttle forwards
//! the first observation of a policy immediately, then buffers observations
//! and only forwards a settled state once per interval, and only when it
//! differs from what was last forwarded.
//!
//! Entries are keyed by `metadata.uid`. Time is passed in by the caller so the
//! state machine stays deterministic under test.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use fleet_core::Resource;
use fnv::FnvHashMap;
use tracing::trace;

/// Settled compliance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceState {
    /// All recent samples were compliant.
    Compliant,
    /// Recent samples were mostly non-compliant, or thrashing.
    NonCompliant,
}

impl ComplianceState {
    /// Value written to `status.compliant`.
    pub fn as_str(self) -> &'static str {
        match self {
            ComplianceState::Compliant => "Compliant",
            ComplianceState::NonCompliant => "NonCompliant",
        }
    }
}

/// Throttle tuning.
///
/// The thresholds are heuristics; the defaults match the behaviour clients
/// have always seen.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Kind the throttle applies to.
    pub kind: String,
    /// Poll interval; at most one settled update per interval.
    pub interval: Duration,
    /// Samples kept per resource.
    pub max_samples: usize,
    /// Standard deviation above which the signal counts as thrashing.
    pub thrash_stddev: f64,
    /// Mean below which a settled signal is compliant.
    pub compliant_mean: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            kind: "Policy".to_string(),
            interval: Duration::from_secs(10),
            max_samples: 10,
            thrash_stddev: 0.9,
            compliant_mean: 2.0,
        }
    }
}

/// Outcome of an observation.
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleDecision {
    /// Forward this resource now.
    Forward(Resource),
    /// Hold the update back.
    Suppress,
}

/// Score a raw compliance value. Anything but `Compliant` counts as bad.
fn score(resource: &Resource) -> f64 {
    match resource.compliance() {
        Some("Compliant") => 1.0,
        _ => 3.0,
    }
}

/// Settle a sample history into a single state.
///
/// Uses population mean and standard deviation.
///
/// ```rust
/// use fleet_cache::{settle, ComplianceState, ThrottleConfig};
///
/// let config = ThrottleConfig::default();
/// let flapping = [1.0, 1.0, 1.0, 1.0, 1.0, 3.0, 3.0, 3.0, 3.0, 3.0];
/// assert_eq!(settle(&flapping, &config), ComplianceState::NonCompliant);
/// assert_eq!(settle(&[1.0; 10], &config), ComplianceState::Compliant);
/// ```
pub fn settle(history: &[f64], config: &ThrottleConfig) -> ComplianceState {
    if history.is_empty() {
        return ComplianceState::NonCompliant;
    }
    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    let variance = history.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();

    if stddev > config.thrash_stddev {
        ComplianceState::NonCompliant
    } else if mean < config.compliant_mean {
        ComplianceState::Compliant
    } else {
        ComplianceState::NonCompliant
    }
}

#[derive(Debug)]
struct ThrottleEntry {
    window_start: Instant,
    last_activity: Option<Instant>,
    history: VecDeque<f64>,
    last_emitted: Option<String>,
    pending: Option<Resource>,
}

impl ThrottleEntry {
    fn history(&self) -> Vec<f64> {
        self.history.iter().copied().collect()
    }
}

/// Per-resource compliance debouncer.
#[derive(Debug)]
pub struct ComplianceThrottle {
    config: ThrottleConfig,
    entries: FnvHashMap<String, ThrottleEntry>,
}

impl ComplianceThrottle {
    /// Create a throttle.
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            entries: FnvHashMap::default(),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Whether the throttle applies to `kind`.
    pub fn applies_to(&self, kind: &str) -> bool {
        self.config.kind == kind
    }

    /// Number of tracked resources.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no resource is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Feed one observation.
    pub fn observe(&mut self, mut resource: Resource, now: Instant) -> ThrottleDecision {
        let Some(uid) = resource.uid().map(str::to_string) else {
            return ThrottleDecision::Forward(resource);
        };
        let sample = score(&resource);

        let Some(entry) = self.entries.get_mut(&uid) else {
            let mut history = VecDeque::with_capacity(self.config.max_samples);
            history.push_back(sample);
            self.entries.insert(
                uid,
                ThrottleEntry {
                    window_start: now,
                    last_activity: None,
                    history,
                    last_emitted: resource.compliance().map(str::to_string),
                    pending: None,
                },
            );
            return ThrottleDecision::Forward(resource);
        };

        entry.history.push_back(sample);
        while entry.history.len() > self.config.max_samples {
            entry.history.pop_front();
        }
        entry.last_activity = Some(now);

        if now.duration_since(entry.window_start) < self.config.interval {
            entry.pending = Some(resource);
            trace!(uid = %uid, "buffering compliance update");
            return ThrottleDecision::Suppress;
        }

        let state = settle(&entry.history(), &self.config);
        entry.window_start = now;

        if entry.last_emitted.as_deref() == Some(state.as_str()) {
            entry.pending = Some(resource);
            trace!(uid = %uid, state = state.as_str(), "settled state unchanged");
            return ThrottleDecision::Suppress;
        }

        entry.pending = None;
        entry.last_emitted = Some(state.as_str().to_string());
        resource.set_compliance(state.as_str());
        trace!(uid = %uid, state = state.as_str(), "forwarding settled state");
        ThrottleDecision::Forward(resource)
    }

    /// Stop tracking a resource.
    pub fn forget(&mut self, uid: &str) {
        self.entries.remove(uid);
    }

    /// Sweep idle entries.
    ///
    /// Entries whose window has passed without a settling observation are
    /// removed. Those holding a buffered resource flush it with the settled
    /// state; entries only seen once are simply dropped.
    pub fn purge(&mut self, now: Instant) -> Vec<Resource> {
        let interval = self.config.interval;
        let mut flushed = Vec::new();

        self.entries.retain(|uid, entry| {
            if now.duration_since(entry.window_start) < interval {
                return true;
            }
            if let Some(mut resource) = entry.pending.take() {
                let state = settle(&entry.history(), &self.config);
                resource.set_compliance(state.as_str());
                trace!(uid = %uid, state = state.as_str(), "flushing idle compliance update");
                flushed.push(resource);
            }
            false
        });

        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy(uid: &str, compliant: &str, version: u32) -> Resource {
        serde_json::from_value(json!({
            "kind": "Policy",
            "apiVersion": "policy.open-cluster-management.io/v1",
            "metadata": {"name": "p", "namespace": "ns", "uid": uid, "resourceVersion": version.to_string()},
            "status": {"compliant": compliant}
        }))
        .unwrap()
    }

    fn forwarded(decision: ThrottleDecision) -> Resource {
        match decision {
            ThrottleDecision::Forward(resource) => resource,
            ThrottleDecision::Suppress => panic!("expected forward"),
        }
    }

    #[test]
    fn settle_examples() {
        let config = ThrottleConfig::default();
        let mixed = [1.0, 1.0, 1.0, 1.0, 1.0, 3.0, 3.0, 3.0, 3.0, 3.0];
        assert_eq!(settle(&mixed, &config), ComplianceState::NonCompliant);
        assert_eq!(settle(&[1.0; 10], &config), ComplianceState::Compliant);
        assert_eq!(settle(&[3.0; 4], &config), ComplianceState::NonCompliant);
        // one bad sample in ten: mean 1.2, stddev 0.6
        let mostly_good = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 3.0];
        assert_eq!(settle(&mostly_good, &config), ComplianceState::Compliant);
    }

    #[test]
    fn first_observation_is_forwarded() {
        let mut throttle = ComplianceThrottle::new(ThrottleConfig::default());
        let now = Instant::now();

        let resource = forwarded(throttle.observe(policy("u1", "Pending", 1), now));
        assert_eq!(resource.compliance(), Some("Pending"));
        assert_eq!(throttle.len(), 1);
    }

    #[test]
    fn updates_inside_window_are_buffered() {
        let mut throttle = ComplianceThrottle::new(ThrottleConfig::default());
        let start = Instant::now();

        throttle.observe(policy("u1", "Compliant", 1), start);
        for i in 0..5 {
            let decision = throttle.observe(
                policy("u1", "NonCompliant", 2 + i),
                start + Duration::from_secs(1 + u64::from(i)),
            );
            assert_eq!(decision, ThrottleDecision::Suppress);
        }
    }

    #[test]
    fn settled_change_is_forwarded_once() {
        let mut throttle = ComplianceThrottle::new(ThrottleConfig::default());
        let start = Instant::now();

        throttle.observe(policy("u1", "Compliant", 1), start);
        for i in 1..=4 {
            throttle.observe(
                policy("u1", "NonCompliant", 1 + i),
                start + Duration::from_secs(u64::from(i)),
            );
        }

        let resource = forwarded(throttle.observe(
            policy("u1", "NonCompliant", 10),
            start + Duration::from_secs(10),
        ));
        assert_eq!(resource.compliance(), Some("NonCompliant"));
        assert_eq!(resource.resource_version().unwrap().as_str(), "10");

        // same settled state in the next window is suppressed
        let decision = throttle.observe(
            policy("u1", "NonCompliant", 11),
            start + Duration::from_secs(21),
        );
        assert_eq!(decision, ThrottleDecision::Suppress);
    }

    #[test]
    fn thrashing_settles_non_compliant() {
        let mut throttle = ComplianceThrottle::new(ThrottleConfig::default());
        let start = Instant::now();

        throttle.observe(policy("u1", "Compliant", 1), start);
        for i in 1..10u32 {
            let state = if i % 2 == 0 { "Compliant" } else { "NonCompliant" };
            throttle.observe(
                policy("u1", state, 1 + i),
                start + Duration::from_millis(u64::from(i) * 500),
            );
        }
        let resource = forwarded(throttle.observe(
            policy("u1", "Compliant", 20),
            start + Duration::from_secs(10),
        ));
        assert_eq!(resource.compliance(), Some("NonCompliant"));
    }

    #[test]
    fn purge_discards_first_seen_only() {
        let mut throttle = ComplianceThrottle::new(ThrottleConfig::default());
        let start = Instant::now();
        throttle.observe(policy("u1", "Compliant", 1), start);

        assert!(throttle.purge(start + Duration::from_secs(5)).is_empty());
        assert_eq!(throttle.len(), 1);

        assert!(throttle.purge(start + Duration::from_secs(10)).is_empty());
        assert!(throttle.is_empty());
    }

    #[test]
    fn purge_flushes_quiet_pending() {
        let mut throttle = ComplianceThrottle::new(ThrottleConfig::default());
        let start = Instant::now();
        throttle.observe(policy("u1", "Compliant", 1), start);
        throttle.observe(policy("u1", "Compliant", 2), start + Duration::from_secs(2));

        assert!(throttle.purge(start + Duration::from_secs(9)).is_empty());
        assert_eq!(throttle.len(), 1);

        // Due when the window closes, not a full interval after the last update.
        let flushed = throttle.purge(start + Duration::from_secs(10));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].compliance(), Some("Compliant"));
        assert_eq!(flushed[0].resource_version().unwrap().as_str(), "2");
        assert!(throttle.is_empty());
    }

    #[test]
    fn purge_uses_window_after_late_update() {
        let mut throttle = ComplianceThrottle::new(ThrottleConfig::default());
        let start = Instant::now();
        throttle.observe(policy("u1", "Compliant", 1), start);
        throttle.observe(policy("u1", "NonCompliant", 2), start + Duration::from_secs(9));

        let flushed = throttle.purge(start + Duration::from_secs(10));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].resource_version().unwrap().as_str(), "2");
        assert_eq!(flushed[0].compliance(), Some("NonCompliant"));
        assert!(throttle.is_empty());
    }

    #[test]
    fn history_is_capped() {
        let config = ThrottleConfig::default();
        let mut throttle = ComplianceThrottle::new(config.clone());
        let start = Instant::now();
        throttle.observe(policy("u1", "NonCompliant", 1), start);
        for i in 0..30u32 {
            throttle.observe(
                policy("u1", "Compliant", 2 + i),
                start + Duration::from_millis(u64::from(i) * 100),
            );
        }
        assert_eq!(throttle.entries["u1"].history.len(), config.max_samples);
    }

    #[test]
    fn resources_without_uid_pass_through() {
        let mut throttle = ComplianceThrottle::new(ThrottleConfig::default());
        let mut resource = policy("u1", "Compliant", 1);
        resource.metadata.uid = None;
        let now = Instant::now();

        assert!(matches!(
            throttle.observe(resource.clone(), now),
            ThrottleDecision::Forward(_)
        ));
        assert!(matches!(
            throttle.observe(resource, now),
            ThrottleDecision::Forward(_)
        ));
        assert!(throttle.is_empty());
    }
}
