//! Session registry and broadcast.
//!
//! The registry is the [`EventListener`] of the event log. Each appended event
//! is offered to every session: the session filter is applied, the
//! authorization verdict is started on the runtime, and the pair is queued on
//! the session.
//!
//! Registration copies the log inside [`EventLog::with_snapshot`], the same
//! lock the log holds while broadcasting. A session therefore receives every
//! event up to the snapshot through the packed snapshot and every later event
//! live, with no gap and no duplicate.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fleet_cache::{EventListener, EventLog};
use fleet_core::{Event, FleetError, FleetResult, SharedClock};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::auth::Authorizer;
use crate::encoder::StreamEncoder;
use crate::metrics::FleetMetrics;
use crate::session::{FrameSink, Session, SessionFilter, SessionId, Verdict};
use crate::snapshot::SnapshotPlanner;

/// All connected sessions.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    log: Arc<EventLog>,
    authorizer: Arc<Authorizer>,
    planner: SnapshotPlanner,
    clock: SharedClock,
    metrics: FleetMetrics,
    runtime: Handle,
    session_timeout: Duration,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("session_timeout", &self.session_timeout)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Create a registry. Must be called from within a Tokio runtime.
    pub fn new(
        log: Arc<EventLog>,
        authorizer: Arc<Authorizer>,
        planner: SnapshotPlanner,
        clock: SharedClock,
        metrics: FleetMetrics,
        session_timeout: Duration,
    ) -> FleetResult<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            FleetError::Configuration(format!("session registry needs a tokio runtime: {e}"))
        })?;
        Ok(Self {
            sessions: DashMap::new(),
            log,
            authorizer,
            planner,
            clock,
            metrics,
            runtime,
            session_timeout,
        })
    }

    /// The authorizer used for every session.
    pub fn authorizer(&self) -> &Arc<Authorizer> {
        &self.authorizer
    }

    /// Register session `id` and queue its initial snapshot.
    pub fn register(
        &self,
        id: SessionId,
        token: Arc<str>,
        filter: SessionFilter,
        encoder: StreamEncoder,
        sink: Arc<dyn FrameSink>,
    ) -> Arc<Session> {
        let encoding = encoder.encoding();
        let session = Arc::new(Session::new(
            id,
            token,
            filter,
            encoder,
            sink,
            Arc::clone(&self.clock),
            self.runtime.clone(),
            self.metrics.clone(),
        ));

        let queued = self.log.with_snapshot(|events| {
            let packed = self.planner.pack(events);
            self.sessions.insert(id, Arc::clone(&session));
            let count = packed.len();
            for event in packed {
                self.offer(&session, event);
            }
            count
        });

        info!(
            session = %id,
            encoding = encoding.as_str(),
            snapshot = queued,
            sessions = self.sessions.len(),
            "session registered"
        );
        session
    }

    fn offer(&self, session: &Arc<Session>, event: Arc<Event>) {
        if !session.filter().matches(&event) {
            return;
        }
        let verdict = match self.authorizer.decide_now(&event) {
            Some(allowed) => Verdict::Ready(allowed),
            None => {
                let authorizer = Arc::clone(&self.authorizer);
                let token = Arc::clone(session.token());
                let event = Arc::clone(&event);
                Verdict::Checking(
                    self.runtime
                        .spawn(async move { authorizer.allowed(&token, &event).await }),
                )
            }
        };
        session.enqueue(event, verdict);
    }

    /// Remove and close a session. Returns whether it was registered.
    pub fn deregister(&self, id: SessionId) -> bool {
        match self.sessions.remove(&id) {
            Some((_, session)) => {
                session.close();
                info!(session = %id, sessions = self.sessions.len(), "session deregistered");
                true
            }
            None => false,
        }
    }

    /// Look up a session.
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is connected.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Write a keep-alive to every session whose writer is free. Returns the
    /// number written and skipped.
    pub fn keepalive(&self) -> (usize, usize) {
        let mut written = 0;
        let mut skipped = 0;
        for entry in self.sessions.iter() {
            if entry.value().keepalive() {
                written += 1;
            } else {
                skipped += 1;
            }
        }
        self.metrics.keepalive(written, skipped);
        (written, skipped)
    }

    /// Close sessions whose drain loop has been running longer than the
    /// session timeout. Returns the number reaped.
    pub fn reap(&self) -> usize {
        let now = self.clock.now();
        let stuck: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .drain_started()
                    .is_some_and(|started| now.duration_since(started) >= self.session_timeout)
            })
            .map(|entry| *entry.key())
            .collect();

        let mut reaped = 0;
        for id in stuck {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.mark_reaped();
                session.close();
                info!(session = %id, "session reaped after drain timeout");
                reaped += 1;
            }
        }
        reaped
    }

    /// Close every session.
    pub fn close_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.deregister(id);
        }
        debug!("closed all sessions");
    }
}

impl EventListener for SessionRegistry {
    fn on_event(&self, event: &Arc<Event>) {
        self.metrics.event_pushed(event.data.type_name());
        for entry in self.sessions.iter() {
            self.offer(entry.value(), Arc::clone(event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessCache, AccessReviewer, AccessTarget, Verb};
    use crate::config::{CompressionConfig, SnapshotConfig};
    use crate::encoder::Encoding;
    use crate::session::ChannelSink;
    use async_trait::async_trait;
    use bytes::Bytes;
    use fleet_core::{EventData, ManualClock, Resource};
    use tokio::sync::mpsc;

    /// Allows everything outside namespace `secret`; optionally slow.
    struct NamespaceRule {
        delay: Duration,
    }

    #[async_trait]
    impl AccessReviewer for NamespaceRule {
        async fn review(&self, _token: &str, target: &AccessTarget, verb: Verb) -> FleetResult<bool> {
            tokio::time::sleep(self.delay).await;
            Ok(verb == Verb::Get && target.namespace.as_deref() != Some("secret"))
        }
    }

    struct Fixture {
        log: Arc<EventLog>,
        registry: Arc<SessionRegistry>,
        clock: Arc<ManualClock>,
    }

    fn fixture(delay: Duration) -> Fixture {
        let clock = Arc::new(ManualClock::new());
        let metrics = FleetMetrics::new();
        let cache = AccessCache::new(
            Arc::new(NamespaceRule { delay }),
            Duration::from_secs(60),
            clock.clone(),
            metrics.clone(),
        );
        let authorizer = Arc::new(Authorizer::new(cache, vec!["FeatureGate".to_string()]));
        let log = Arc::new(EventLog::new());
        let registry = Arc::new(
            SessionRegistry::new(
                Arc::clone(&log),
                authorizer,
                SnapshotPlanner::new(SnapshotConfig::default()),
                clock.clone(),
                metrics,
                Duration::from_secs(4 * 60 * 60),
            )
            .unwrap(),
        );
        log.set_listener(registry.clone());
        Fixture {
            log,
            registry,
            clock,
        }
    }

    fn connect(
        registry: &SessionRegistry,
        filter: SessionFilter,
        capacity: usize,
    ) -> (Arc<Session>, mpsc::Receiver<Bytes>) {
        let id = SessionId::new();
        let (sink, rx) = ChannelSink::channel(id, capacity);
        let encoder = StreamEncoder::new(Encoding::Identity, &CompressionConfig::default());
        let session = registry.register(id, Arc::from("token"), filter, encoder, Arc::new(sink));
        (session, rx)
    }

    fn modified(namespace: &str, name: &str) -> EventData {
        EventData::Modified {
            object: Resource::new("Policy", "v1", Some(namespace.to_string()), name),
        }
    }

    fn summary(frame: &Bytes) -> String {
        let text = std::str::from_utf8(frame).unwrap();
        let data = text
            .lines()
            .find_map(|line| line.strip_prefix("data:"))
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(data).unwrap();
        match value["object"]["metadata"]["name"].as_str() {
            Some(name) => format!("{}:{}", value["type"].as_str().unwrap(), name),
            None => value["type"].as_str().unwrap().to_string(),
        }
    }

    async fn next_frames(rx: &mut mpsc::Receiver<Bytes>, n: usize) -> Vec<String> {
        let mut out = Vec::new();
        for _ in 0..n {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("frame in time")
                .expect("stream open");
            out.push(summary(&frame));
        }
        out
    }

    #[tokio::test]
    async fn snapshot_then_live_without_gap() {
        let f = fixture(Duration::ZERO);
        f.log.push_event(modified("a", "p1"));

        let (_session, mut rx) = connect(&f.registry, SessionFilter::default(), 64);
        f.log.push_event(modified("a", "p2"));

        assert_eq!(
            next_frames(&mut rx, 5).await,
            vec!["START", "MODIFIED:p1", "EOP", "LOADED", "MODIFIED:p2"]
        );
        assert_eq!(next_frames(&mut rx, 1).await, vec!["LOADED"]);
    }

    #[tokio::test]
    async fn slow_authorization_keeps_order() {
        let f = fixture(Duration::from_millis(20));
        let (_session, mut rx) = connect(&f.registry, SessionFilter::default(), 64);
        assert_eq!(next_frames(&mut rx, 2).await, vec!["START", "LOADED"]);

        f.log.push_event(modified("a", "first"));
        f.log.push_event(EventData::Deleted {
            object: Resource::new("Policy", "v1", Some("a".into()), "gone"),
        });
        f.log.push_event(modified("b", "second"));

        assert_eq!(
            next_frames(&mut rx, 6).await,
            vec!["MODIFIED:first", "LOADED", "DELETED:gone", "LOADED", "MODIFIED:second", "LOADED"]
        );
    }

    #[tokio::test]
    async fn unauthorized_and_filtered_events_are_withheld() {
        let f = fixture(Duration::ZERO);
        let filter = SessionFilter::from_query(None, Some("a,secret"));
        let (_session, mut rx) = connect(&f.registry, filter, 64);
        assert_eq!(next_frames(&mut rx, 2).await, vec!["START", "LOADED"]);

        f.log.push_event(modified("secret", "hidden"));
        f.log.push_event(modified("other", "filtered"));
        f.log.push_event(modified("a", "visible"));

        assert_eq!(
            next_frames(&mut rx, 4).await,
            vec!["LOADED", "LOADED", "MODIFIED:visible", "LOADED"]
        );
    }

    #[tokio::test]
    async fn full_sink_delays_without_dropping() {
        let f = fixture(Duration::ZERO);
        let (session, mut rx) = connect(&f.registry, SessionFilter::default(), 1);
        for i in 0..10 {
            f.log.push_event(modified("a", &format!("p{i}")));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.is_draining());
        assert!(!session.keepalive());

        let frames = next_frames(&mut rx, 22).await;
        let names: Vec<&String> = frames.iter().filter(|f| f.starts_with("MODIFIED")).collect();
        assert_eq!(names.len(), 10);
        assert_eq!(names[0], "MODIFIED:p0");
        assert_eq!(names[9], "MODIFIED:p9");
    }

    #[tokio::test]
    async fn keepalive_skips_busy_sessions() {
        let f = fixture(Duration::ZERO);
        let (_session, mut rx) = connect(&f.registry, SessionFilter::default(), 8);
        next_frames(&mut rx, 2).await;

        assert_eq!(f.registry.keepalive(), (1, 0));
        let frame = rx.recv().await.unwrap();
        assert_eq!(&frame[..], b":\n\n");
    }

    #[tokio::test]
    async fn reaper_removes_stuck_sessions() {
        let f = fixture(Duration::ZERO);
        // Capacity 1 and nobody reading: the drain loop stalls.
        let (session, mut rx) = connect(&f.registry, SessionFilter::default(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.drain_started().is_some());

        f.clock.advance(Duration::from_secs(4 * 60 * 60 - 1));
        assert_eq!(f.registry.reap(), 0);

        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.registry.reap(), 1);
        assert!(f.registry.is_empty());
        assert!(session.is_closed());

        // The buffered frame is still readable, then the stream ends.
        let _ = rx.recv().await;
        assert!(tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .is_none());

        // No further writes reach the closed session.
        f.log.push_event(modified("a", "late"));
        assert_eq!(session.queued(), 0);
    }

    #[tokio::test]
    async fn idle_sessions_are_not_reaped() {
        let f = fixture(Duration::ZERO);
        let (session, mut rx) = connect(&f.registry, SessionFilter::default(), 8);
        next_frames(&mut rx, 2).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(session.drain_started().is_none());

        f.clock.advance(Duration::from_secs(5 * 60 * 60));
        assert_eq!(f.registry.reap(), 0);
    }

    #[tokio::test]
    async fn deregister_closes_stream() {
        let f = fixture(Duration::ZERO);
        let (session, mut rx) = connect(&f.registry, SessionFilter::default(), 8);
        next_frames(&mut rx, 2).await;

        assert!(f.registry.deregister(session.id()));
        assert!(!f.registry.deregister(session.id()));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn registration_during_pushes_sees_each_event_once() {
        let f = fixture(Duration::ZERO);

        let pusher = {
            let log = Arc::clone(&f.log);
            tokio::spawn(async move {
                for i in 0..400 {
                    log.push_event(modified("a", &format!("p{i}")));
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        let (_session, mut rx) = connect(&f.registry, SessionFilter::default(), 100_000);
        pusher.await.unwrap();

        let mut seen = std::collections::HashSet::new();
        while !seen.contains("MODIFIED:p399") {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("frame in time")
                .expect("stream open");
            let name = summary(&frame);
            if name.starts_with("MODIFIED") {
                assert!(seen.insert(name), "duplicate frame");
            }
        }
        assert_eq!(seen.len(), 400);
    }
}
