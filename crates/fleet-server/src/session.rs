//! Client sessions.
//!
//! A [`Session`] is one open `/events` response. Events offered to it are
//! queued together with their pending authorization verdict; a single drain
//! task per session pops them strictly in order, waits for each verdict,
//! encodes the frame and writes it to the session's [`FrameSink`], waiting
//! whenever the sink is full.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use fleet_core::{Event, FleetError, FleetResult, SharedClock};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::encoder::StreamEncoder;
use crate::metrics::{FleetMetrics, SessionTracker};

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Generate a new unique session ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value.
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Subscription filter from the `events=` and `namespaces=` query parameters.
///
/// An absent list accepts everything. The event list only applies to named
/// events and the namespace list only to namespaced ones; control events
/// always pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    events: Option<HashSet<String>>,
    namespaces: Option<HashSet<String>>,
}

fn allow_list(value: Option<&str>) -> Option<HashSet<String>> {
    let set: HashSet<String> = value?
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();
    (!set.is_empty()).then_some(set)
}

impl SessionFilter {
    /// Build from comma separated allow-lists.
    pub fn from_query(events: Option<&str>, namespaces: Option<&str>) -> Self {
        Self {
            events: allow_list(events),
            namespaces: allow_list(namespaces),
        }
    }

    /// Whether the session subscribed to `event`.
    pub fn matches(&self, event: &Event) -> bool {
        if event.data.is_control() {
            return true;
        }
        if let (Some(events), Some(name)) = (&self.events, &event.name) {
            if !events.contains(name) {
                return false;
            }
        }
        if let (Some(namespaces), Some(namespace)) = (&self.namespaces, &event.namespace) {
            if !namespaces.contains(namespace) {
                return false;
            }
        }
        true
    }
}

/// Where a session's encoded frames go.
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    /// Write a frame, waiting until the client has drained enough to take it.
    async fn send(&self, frame: Bytes) -> FleetResult<()>;

    /// Whether a frame can be written without waiting.
    fn is_ready(&self) -> bool;

    /// Write a frame without waiting.
    fn try_send(&self, frame: Bytes) -> FleetResult<()>;

    /// Stop accepting frames; the client sees the end of the stream.
    fn close(&self);
}

/// [`FrameSink`] backed by a bounded channel read by the response body.
#[derive(Debug)]
pub struct ChannelSink {
    session: SessionId,
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl ChannelSink {
    /// Create a sink holding at most `capacity` unread frames.
    pub fn channel(session: SessionId, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                session,
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn sender(&self) -> FleetResult<mpsc::Sender<Bytes>> {
        self.tx.lock().clone().ok_or_else(|| self.closed())
    }

    fn closed(&self) -> FleetError {
        FleetError::SinkClosed {
            session: self.session.to_string(),
        }
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&self, frame: Bytes) -> FleetResult<()> {
        let tx = self.sender()?;
        tx.send(frame).await.map_err(|_| self.closed())
    }

    fn is_ready(&self) -> bool {
        self.tx
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed() && tx.capacity() > 0)
    }

    fn try_send(&self, frame: Bytes) -> FleetResult<()> {
        self.sender()?.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => FleetError::RateLimited {
                message: format!("{} is not draining", self.session),
            },
            TrySendError::Closed(_) => self.closed(),
        })
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

/// Authorization state of a queued event.
#[derive(Debug)]
pub enum Verdict {
    /// Already decided.
    Ready(bool),
    /// Review still running.
    Checking(JoinHandle<bool>),
}

impl Verdict {
    async fn resolve(self, session: SessionId) -> bool {
        match self {
            Verdict::Ready(allowed) => allowed,
            Verdict::Checking(handle) => match handle.await {
                Ok(allowed) => allowed,
                Err(e) => {
                    warn!(session = %session, error = %e, "authorization task failed");
                    false
                }
            },
        }
    }
}

#[derive(Debug)]
struct Queued {
    event: Arc<Event>,
    verdict: Verdict,
}

#[derive(Debug, Default)]
struct SessionQueue {
    items: VecDeque<Queued>,
    draining: bool,
    drain_started: Option<Instant>,
    drain_task: Option<JoinHandle<()>>,
}

struct SessionWriter {
    encoder: StreamEncoder,
    sink: Arc<dyn FrameSink>,
}

/// One connected client.
pub struct Session {
    id: SessionId,
    token: Arc<str>,
    filter: SessionFilter,
    created_at: Instant,
    queue: Mutex<SessionQueue>,
    /// Held across sink writes; keep-alive only ever try-locks it.
    writer: tokio::sync::Mutex<SessionWriter>,
    sink: Arc<dyn FrameSink>,
    closed: AtomicBool,
    clock: SharedClock,
    runtime: Handle,
    metrics: FleetMetrics,
    tracker: Mutex<SessionTracker>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("queued", &self.queued())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session writing through `encoder` into `sink`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SessionId,
        token: Arc<str>,
        filter: SessionFilter,
        encoder: StreamEncoder,
        sink: Arc<dyn FrameSink>,
        clock: SharedClock,
        runtime: Handle,
        metrics: FleetMetrics,
    ) -> Self {
        let tracker = SessionTracker::new(metrics.clone(), encoder.encoding().as_str());
        Self {
            id,
            token,
            filter,
            created_at: clock.now(),
            queue: Mutex::new(SessionQueue::default()),
            writer: tokio::sync::Mutex::new(SessionWriter {
                encoder,
                sink: Arc::clone(&sink),
            }),
            sink,
            closed: AtomicBool::new(false),
            clock,
            runtime,
            metrics,
            tracker: Mutex::new(tracker),
        }
    }

    /// Session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Bearer token of the client.
    pub fn token(&self) -> &Arc<str> {
        &self.token
    }

    /// Subscription filter.
    pub fn filter(&self) -> &SessionFilter {
        &self.filter
    }

    /// When the session was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Events waiting to be written.
    pub fn queued(&self) -> usize {
        self.queue.lock().items.len()
    }

    /// When the running drain loop started, `None` when idle.
    pub fn drain_started(&self) -> Option<Instant> {
        self.queue.lock().drain_started
    }

    /// Whether a drain loop is running.
    pub fn is_draining(&self) -> bool {
        self.queue.lock().draining
    }

    /// Whether the session was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue `event` and start the drain loop if it is idle.
    pub fn enqueue(self: &Arc<Self>, event: Arc<Event>, verdict: Verdict) {
        if self.is_closed() {
            return;
        }
        let mut queue = self.queue.lock();
        queue.items.push_back(Queued { event, verdict });
        if !queue.draining {
            queue.draining = true;
            queue.drain_started = Some(self.clock.now());
            let session = Arc::clone(self);
            queue.drain_task = Some(self.runtime.spawn(session.drain()));
        }
    }

    async fn drain(self: Arc<Self>) {
        trace!(session = %self.id, "drain started");
        loop {
            let next = {
                let mut queue = self.queue.lock();
                match queue.items.pop_front() {
                    Some(next) => next,
                    None => {
                        queue.draining = false;
                        queue.drain_started = None;
                        queue.drain_task = None;
                        trace!(session = %self.id, "drain finished");
                        return;
                    }
                }
            };

            if !next.verdict.resolve(self.id).await {
                if let Some(kind) = next.event.kind() {
                    self.metrics.frame_suppressed(kind);
                }
                trace!(session = %self.id, id = %next.event.id, "event withheld");
                continue;
            }

            if let Err(e) = self.write(&next.event).await {
                debug!(session = %self.id, error = %e, "write failed, closing session");
                self.close();
                return;
            }
        }
    }

    async fn write(&self, event: &Event) -> FleetResult<()> {
        let mut writer = self.writer.lock().await;
        let bytes = writer.encoder.encode_event(event)?;
        let len = bytes.len();
        if !writer.sink.is_ready() {
            self.metrics.backpressure();
            trace!(session = %self.id, "waiting for client to drain");
        }
        writer.sink.send(bytes).await?;
        self.metrics.frame_delivered(event.data.type_name(), len);
        Ok(())
    }

    /// Write a keep-alive comment unless the writer is busy or the client is
    /// behind. Returns whether one was written.
    pub fn keepalive(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let Ok(mut writer) = self.writer.try_lock() else {
            return false;
        };
        if !writer.sink.is_ready() {
            return false;
        }
        let bytes = match writer.encoder.encode_keepalive() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(session = %self.id, error = %e, "keep-alive encoding failed");
                return false;
            }
        };
        writer.sink.try_send(bytes).is_ok()
    }

    /// Close the session: stop the drain loop, drop queued events and end the
    /// client's stream.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = {
            let mut queue = self.queue.lock();
            queue.items.clear();
            queue.draining = false;
            queue.drain_started = None;
            queue.drain_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.sink.close();
        debug!(session = %self.id, "session closed");
    }

    /// Record the session as removed by the reaper.
    pub fn mark_reaped(&self) {
        self.tracker.lock().mark_reaped();
    }
}
