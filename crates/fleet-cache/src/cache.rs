//! Resource cache.
//!
//! The cache keeps the latest known state per [`ResourceKey`] together with
//! the id of the event that announced it. Applying a record either does
//! nothing (re-delivery, stale version, throttled update) or supersedes the
//! previous event for that identity in the [`EventLog`].
//!
//! ## Important
//!
//! The entry map lock is taken before the throttle lock and the event log
//! lock, never the other way around.

use std::sync::Arc;

use fleet_core::{
    EventData, EventId, Resource, ResourceKey, ResourceVersion, SharedClock, SystemClock,
    WatchRecord,
};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::event_log::EventLog;
use crate::stats::CacheStats;
use crate::throttle::{ComplianceThrottle, ThrottleConfig, ThrottleDecision};

/// Destination for parsed watch records.
///
/// Returns the version the watch may resume from, if the record carried one.
pub trait RecordSink: Send + Sync {
    /// Apply one record.
    fn apply(&self, record: WatchRecord) -> Option<ResourceVersion>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    resource: Resource,
    version: Option<ResourceVersion>,
    event_id: EventId,
}

/// Latest known state per resource identity.
pub struct ResourceCache {
    entries: Mutex<FnvHashMap<ResourceKey, CacheEntry>>,
    log: Arc<EventLog>,
    throttle: Option<Mutex<ComplianceThrottle>>,
    settings_source: Option<ResourceKey>,
    clock: SharedClock,
    stats: Arc<CacheStats>,
}

impl std::fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("entries", &self.len())
            .field("throttled_kind", &self.throttled_kind())
            .field("settings_source", &self.settings_source)
            .finish()
    }
}

impl ResourceCache {
    /// Create a cache builder.
    pub fn builder() -> CacheBuilder {
        CacheBuilder::new()
    }

    /// The event log this cache publishes to.
    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }

    /// Cache statistics.
    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    /// Number of cached identities, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kind handled by the compliance throttle, if enabled.
    pub fn throttled_kind(&self) -> Option<String> {
        self.throttle
            .as_ref()
            .map(|throttle| throttle.lock().config().kind.clone())
    }

    /// Cached state for one identity.
    pub fn get(&self, key: &ResourceKey) -> Option<Resource> {
        self.entries.lock().get(key).map(|e| e.resource.clone())
    }

    /// Event id currently announcing an identity.
    pub fn event_id(&self, key: &ResourceKey) -> Option<EventId> {
        self.entries.lock().get(key).map(|e| e.event_id)
    }

    /// All cached resources of a kind and API version.
    ///
    /// Tombstones of deleted resources are included; they carry no spec or status.
    pub fn resources(&self, kind: &str, api_version: &str) -> Vec<Resource> {
        self.entries
            .lock()
            .iter()
            .filter(|(key, entry)| key.kind == kind && entry.resource.api_version == api_version)
            .map(|(_, entry)| entry.resource.clone())
            .collect()
    }

    /// Apply one watch record.
    ///
    /// Returns the version the watch should resume from.
    pub fn apply(&self, record: WatchRecord) -> Option<ResourceVersion> {
        let (mut resource, deleted, added) = match record {
            WatchRecord::Error(status) => {
                if status.code != Some(410) {
                    warn!(
                        code = ?status.code,
                        reason = ?status.reason,
                        message = ?status.message,
                        "watch error record"
                    );
                }
                return None;
            }
            WatchRecord::Bookmark(resource) => {
                return resource.metadata.resource_version;
            }
            WatchRecord::Added(resource) => (resource, false, true),
            WatchRecord::Modified(resource) => (resource, false, false),
            WatchRecord::Deleted(resource) => (resource, true, false),
        };

        let Some(key) = resource.key() else {
            self.stats.record_invalid();
            debug!(kind = %resource.kind, "dropping record without kind or name");
            return None;
        };

        resource.strip_server_fields();
        let version = resource.metadata.resource_version.clone();
        trace!(key = %key, version = ?version, deleted, "apply record");

        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            if existing.version == version {
                self.stats.record_duplicate();
                return version;
            }
            if let (Some(incoming), Some(cached)) = (&version, &existing.version) {
                if incoming.is_older_than(cached) {
                    self.stats.record_stale();
                    debug!(key = %key, incoming = %incoming, cached = %cached, "dropping stale record");
                    return version;
                }
            }
        }

        let data = if deleted {
            if let (Some(throttle), Some(uid)) = (&self.throttle, resource.uid()) {
                throttle.lock().forget(uid);
            }
            EventData::Deleted {
                object: resource.tombstone(),
            }
        } else {
            if self.settings_source.as_ref() == Some(&key) {
                self.log.push_settings(resource.string_map("data"));
            }

            let resource = match &self.throttle {
                Some(throttle) => {
                    let mut throttle = throttle.lock();
                    if throttle.applies_to(&resource.kind) {
                        match throttle.observe(resource, self.clock.now()) {
                            ThrottleDecision::Forward(resource) => resource,
                            ThrottleDecision::Suppress => {
                                self.stats.record_throttled();
                                return version;
                            }
                        }
                    } else {
                        resource
                    }
                }
                None => resource,
            };

            if added {
                EventData::Added { object: resource }
            } else {
                EventData::Modified { object: resource }
            }
        };

        self.commit(&mut entries, key, version.clone(), data);
        version
    }

    /// Flush throttled resources that have gone quiet.
    ///
    /// Returns the number of events pushed.
    pub fn sweep_throttle(&self) -> usize {
        let Some(throttle) = &self.throttle else {
            return 0;
        };
        let now = self.clock.now();
        let flushed = throttle.lock().purge(now);
        if flushed.is_empty() {
            return 0;
        }

        let mut entries = self.entries.lock();
        let mut pushed = 0;
        for resource in flushed {
            let Some(key) = resource.key() else {
                continue;
            };
            let version = resource.metadata.resource_version.clone();
            if let Some(existing) = entries.get(&key) {
                if let (Some(incoming), Some(cached)) = (&version, &existing.version) {
                    if !incoming.is_newer_than(cached) {
                        continue;
                    }
                }
            }
            self.commit(
                &mut entries,
                key,
                version,
                EventData::Modified { object: resource },
            );
            pushed += 1;
        }
        debug!(pushed, "flushed throttled resources");
        pushed
    }

    fn commit(
        &self,
        entries: &mut FnvHashMap<ResourceKey, CacheEntry>,
        key: ResourceKey,
        version: Option<ResourceVersion>,
        data: EventData,
    ) {
        let Some(resource) = data.resource().cloned() else {
            return;
        };
        let previous = entries.get(&key).map(|e| e.event_id);
        let event_id = self.log.supersede(previous, data);
        entries.insert(
            key,
            CacheEntry {
                resource,
                version,
                event_id,
            },
        );
        self.stats.record_applied();
    }
}

impl RecordSink for ResourceCache {
    fn apply(&self, record: WatchRecord) -> Option<ResourceVersion> {
        ResourceCache::apply(self, record)
    }
}

/// Builder for a configured cache.
#[derive(Debug, Default)]
pub struct CacheBuilder {
    log: Option<Arc<EventLog>>,
    throttle: Option<ThrottleConfig>,
    settings_source: Option<ResourceKey>,
    clock: Option<SharedClock>,
    capacity: Option<usize>,
}

impl CacheBuilder {
    /// Create a new cache builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish into an existing event log.
    pub fn event_log(mut self, log: Arc<EventLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Enable the compliance throttle.
    pub fn throttle(mut self, config: ThrottleConfig) -> Self {
        self.throttle = Some(config);
        self
    }

    /// Publish the `data` of this ConfigMap as the SETTINGS event.
    pub fn settings_source(mut self, key: ResourceKey) -> Self {
        self.settings_source = Some(key);
        self
    }

    /// Use a specific clock for the throttle.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the initial capacity.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Build the cache.
    pub fn build(self) -> ResourceCache {
        let log = self.log.unwrap_or_else(|| Arc::new(EventLog::new()));
        let stats = Arc::clone(log.stats());
        let mut entries = FnvHashMap::default();
        entries.reserve(self.capacity.unwrap_or(1024));

        ResourceCache {
            entries: Mutex::new(entries),
            log,
            throttle: self
                .throttle
                .map(|config| Mutex::new(ComplianceThrottle::new(config))),
            settings_source: self.settings_source,
            clock: self.clock.unwrap_or_else(SystemClock::shared),
            stats,
        }
    }
}
