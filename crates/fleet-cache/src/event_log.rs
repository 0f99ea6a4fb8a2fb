//! Outbound event log.
//!
//! The log is an ordered map from [`EventId`] to [`Event`]. It always holds a
//! START marker and exactly one LOADED marker; LOADED is re-created after every
//! push so its id is always the largest in the log.
//!
//! Every event is handed to the registered [`EventListener`] while the log
//! lock is held. [`EventLog::with_snapshot`] takes the same lock, which is what
//! lets a new session copy the log and start receiving live events without a
//! gap or a duplicate.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use fleet_core::{Event, EventData, EventId};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::stats::CacheStats;

/// Receives every event appended to the log.
///
/// Called with the log lock held, so implementations must not block and must
/// not call back into the log.
pub trait EventListener: Send + Sync {
    /// Handle a newly appended event.
    fn on_event(&self, event: &Arc<Event>);
}

#[derive(Debug)]
struct LogState {
    events: BTreeMap<EventId, Arc<Event>>,
    next_id: u64,
    start: EventId,
    loaded: EventId,
    settings: Option<EventId>,
}

impl LogState {
    fn allocate(&mut self) -> EventId {
        let id = EventId::new(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Monotonic log of outbound events.
pub struct EventLog {
    state: Mutex<LogState>,
    listener: RwLock<Option<Arc<dyn EventListener>>>,
    stats: Arc<CacheStats>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .field("has_listener", &self.listener.read().is_some())
            .finish()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// Create a log holding only START and LOADED.
    pub fn new() -> Self {
        Self::with_stats(Arc::new(CacheStats::new()))
    }

    /// Create a log that records into shared statistics.
    pub fn with_stats(stats: Arc<CacheStats>) -> Self {
        let start = EventId::new(1);
        let loaded = EventId::new(2);
        let mut events = BTreeMap::new();
        events.insert(start, Arc::new(Event::new(start, EventData::Start)));
        events.insert(loaded, Arc::new(Event::new(loaded, EventData::Loaded)));

        Self {
            state: Mutex::new(LogState {
                events,
                next_id: 3,
                start,
                loaded,
                settings: None,
            }),
            listener: RwLock::new(None),
            stats,
        }
    }

    /// Shared statistics.
    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    /// Register the broadcast target, replacing any previous one.
    pub fn set_listener(&self, listener: Arc<dyn EventListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Remove the broadcast target.
    pub fn clear_listener(&self) {
        *self.listener.write() = None;
    }

    /// Append an event and re-create the LOADED marker.
    pub fn push_event(&self, data: EventData) -> EventId {
        let mut state = self.state.lock();
        self.push_locked(&mut state, data)
    }

    /// Evict `previous` (if any) and append `data` in one step.
    ///
    /// Used when a newer event for the same identity supersedes an old one.
    pub fn supersede(&self, previous: Option<EventId>, data: EventData) -> EventId {
        let mut state = self.state.lock();
        if let Some(previous) = previous {
            self.remove_locked(&mut state, previous);
        }
        self.push_locked(&mut state, data)
    }

    /// Replace the live SETTINGS event.
    pub fn push_settings(&self, settings: BTreeMap<String, String>) -> EventId {
        let mut state = self.state.lock();
        if let Some(previous) = state.settings.take() {
            self.remove_locked(&mut state, previous);
        }
        let id = self.push_locked(&mut state, EventData::Settings { settings });
        state.settings = Some(id);
        id
    }

    /// Evict an event. START and LOADED cannot be removed.
    pub fn remove(&self, id: EventId) -> bool {
        let mut state = self.state.lock();
        self.remove_locked(&mut state, id)
    }

    /// Run `f` over the current log with the log lock held.
    ///
    /// No event is appended or broadcast while `f` runs.
    pub fn with_snapshot<R>(&self, f: impl FnOnce(&[Arc<Event>]) -> R) -> R {
        let state = self.state.lock();
        let events: Vec<Arc<Event>> = state.events.values().cloned().collect();
        f(&events)
    }

    /// Copy of the current log in id order.
    pub fn events(&self) -> Vec<Arc<Event>> {
        self.state.lock().events.values().cloned().collect()
    }

    /// Look up an event.
    pub fn get(&self, id: EventId) -> Option<Arc<Event>> {
        self.state.lock().events.get(&id).cloned()
    }

    /// Number of events in the log.
    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    /// Whether the log holds only its markers.
    pub fn is_empty(&self) -> bool {
        self.len() <= 2
    }

    /// Id of the live LOADED marker.
    pub fn loaded_id(&self) -> EventId {
        self.state.lock().loaded
    }

    /// Ids currently in the log.
    pub fn ids(&self) -> BTreeSet<EventId> {
        self.state.lock().events.keys().copied().collect()
    }

    fn push_locked(&self, state: &mut LogState, data: EventData) -> EventId {
        let id = state.allocate();
        let event = Arc::new(Event::new(id, data));
        trace!(event = %id, kind = event.data.type_name(), "push event");
        state.events.insert(id, Arc::clone(&event));
        self.stats.record_pushed();
        self.broadcast(&event);

        let old_loaded = state.loaded;
        state.events.remove(&old_loaded);
        let loaded_id = state.allocate();
        let loaded = Arc::new(Event::new(loaded_id, EventData::Loaded));
        state.events.insert(loaded_id, Arc::clone(&loaded));
        state.loaded = loaded_id;
        self.broadcast(&loaded);

        id
    }

    fn remove_locked(&self, state: &mut LogState, id: EventId) -> bool {
        if id == state.start || id == state.loaded {
            debug!(event = %id, "refusing to evict control marker");
            return false;
        }
        if state.settings == Some(id) {
            state.settings = None;
        }
        let removed = state.events.remove(&id).is_some();
        if removed {
            self.stats.record_evicted();
        }
        removed
    }

    fn broadcast(&self, event: &Arc<Event>) {
        if let Some(listener) = self.listener.read().as_ref() {
            listener.on_event(event);
        }
    }
}
