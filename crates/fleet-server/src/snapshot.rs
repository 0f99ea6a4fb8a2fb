//! Initial snapshot packing.
//!
//! A new session does not get the log in id order. Events are grouped by
//! kind into buckets, each bucket sorted by namespace (or name for
//! cluster-scoped objects) then name, and the buckets are interleaved in
//! rounds so a console can render the most important lists first. Every
//! round and every remainder chunk ends with an EOP marker.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_core::{Event, EventData, EventId};

use crate::config::SnapshotConfig;

/// Snapshot bucket of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// Managed clusters and cluster provisioning objects.
    Cluster,
    /// Per-cluster info.
    Info,
    /// Install progress.
    Install,
    /// Policies and reports.
    Policy,
    /// Addons.
    Addon,
    /// Other known fleet kinds.
    Other,
    /// Everything else.
    Remainder,
}

/// Maps kinds to buckets.
#[derive(Debug, Clone)]
pub struct SnapshotPlanner {
    buckets: HashMap<String, Bucket>,
    config: SnapshotConfig,
}

impl SnapshotPlanner {
    /// Build a planner from the configured kind lists.
    pub fn new(config: SnapshotConfig) -> Self {
        let mut buckets = HashMap::new();
        let lists = [
            (&config.cluster_kinds, Bucket::Cluster),
            (&config.info_kinds, Bucket::Info),
            (&config.install_kinds, Bucket::Install),
            (&config.policy_kinds, Bucket::Policy),
            (&config.addon_kinds, Bucket::Addon),
            (&config.other_kinds, Bucket::Other),
        ];
        for (kinds, bucket) in lists {
            for kind in kinds {
                buckets.entry(kind.clone()).or_insert(bucket);
            }
        }
        Self { buckets, config }
    }

    /// Bucket for `kind`.
    pub fn bucket(&self, kind: &str) -> Bucket {
        self.buckets.get(kind).copied().unwrap_or(Bucket::Remainder)
    }

    /// Order the log `events` (as returned by `EventLog::with_snapshot`) for
    /// delivery to a new session.
    ///
    /// Output is START, control events such as SETTINGS, the interleaved
    /// rounds, the remainder chunks and finally LOADED. EOP markers reuse the
    /// id of the event they follow.
    pub fn pack(&self, events: &[Arc<Event>]) -> Vec<Arc<Event>> {
        let mut start = None;
        let mut loaded = None;
        let mut control = Vec::new();
        let mut cluster = Vec::new();
        let mut info = Vec::new();
        let mut install = Vec::new();
        let mut policy = Vec::new();
        let mut addon = Vec::new();
        let mut other = Vec::new();
        let mut remainder = Vec::new();

        for event in events {
            match &event.data {
                EventData::Start => start = Some(Arc::clone(event)),
                EventData::Loaded => loaded = Some(Arc::clone(event)),
                EventData::Eop => {}
                EventData::Settings { .. } => control.push(Arc::clone(event)),
                EventData::Added { object }
                | EventData::Modified { object }
                | EventData::Deleted { object } => {
                    let target = match self.bucket(&object.kind) {
                        Bucket::Cluster => &mut cluster,
                        Bucket::Info => &mut info,
                        Bucket::Install => &mut install,
                        Bucket::Policy => &mut policy,
                        Bucket::Addon => &mut addon,
                        Bucket::Other => &mut other,
                        Bucket::Remainder => &mut remainder,
                    };
                    target.push(Arc::clone(event));
                }
            }
        }

        let mut out = Vec::with_capacity(events.len() + events.len() / 100 + 4);
        out.extend(start);
        out.extend(control);

        let mut rounds = [
            (sorted(cluster), self.config.cluster_per_round),
            (sorted(info), self.config.info_per_round),
            (sorted(install), self.config.install_per_round),
            (sorted(policy), self.config.policy_per_round),
            (sorted(addon), self.config.addon_per_round),
            (sorted(other), self.config.other_per_round),
        ]
        .map(|(events, per_round)| (events.into_iter(), per_round.max(1)));

        loop {
            let before = out.len();
            for (bucket, per_round) in rounds.iter_mut() {
                out.extend(bucket.by_ref().take(*per_round));
            }
            if out.len() == before {
                break;
            }
            push_eop(&mut out);
        }

        for chunk in sorted(remainder).chunks(self.config.remainder_chunk.max(1)) {
            out.extend(chunk.iter().cloned());
            push_eop(&mut out);
        }

        out.extend(loaded);
        out
    }
}

fn sort_key(event: &Event) -> (&str, &str) {
    let name = event
        .data
        .resource()
        .and_then(|r| r.name())
        .unwrap_or_default();
    let group = event.namespace.as_deref().unwrap_or(name);
    (group, name)
}

fn sorted(mut events: Vec<Arc<Event>>) -> Vec<Arc<Event>> {
    events.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    events
}

fn push_eop(out: &mut Vec<Arc<Event>>) {
    let id = out.last().map(|e| e.id).unwrap_or(EventId::new(0));
    out.push(Arc::new(Event::new(id, EventData::Eop)));
}
