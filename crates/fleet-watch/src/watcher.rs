//! The watch protocol loop.

use std::sync::Arc;
use std::time::Duration;

use fleet_cache::RecordSink;
use fleet_core::{FleetError, FleetResult, ResourceVersion, WatchRecord};
use futures::StreamExt;
use metrics::counter;
use tokio::sync::watch;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::backoff::BackoffPolicy;
use crate::buffer::LineBuffer;
use crate::target::WatchTarget;
use crate::transport::WatchTransport;

/// Lifecycle state of one watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Connecting.
    Starting,
    /// Receiving records.
    Watching,
    /// Waiting before reconnecting.
    Backoff,
    /// Stopped: the service account may not watch this collection.
    Forbidden,
    /// Stopped: the retry budget ran out.
    Failed,
}

impl WatchState {
    /// Whether the watch has stopped for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, WatchState::Forbidden | WatchState::Failed)
    }
}

/// How a single connection ended.
#[derive(Debug)]
enum Outcome {
    Ended,
    Forbidden,
    NotFound,
    RateLimited(Option<Duration>),
    Transient(String),
    Unexpected(u16),
}

/// Keeps one watch alive and feeds its records into a sink.
pub struct ResourceWatcher {
    target: WatchTarget,
    transport: Arc<dyn WatchTransport>,
    sink: Arc<dyn RecordSink>,
    policy: BackoffPolicy,
    state: watch::Sender<WatchState>,
    resume: Option<ResourceVersion>,
    failures: u32,
    unexpected: u32,
}

impl std::fmt::Debug for ResourceWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceWatcher")
            .field("target", &self.target)
            .field("state", &*self.state.borrow())
            .field("resume", &self.resume)
            .field("failures", &self.failures)
            .finish()
    }
}

impl ResourceWatcher {
    /// Create a watcher.
    pub fn new(
        target: WatchTarget,
        transport: Arc<dyn WatchTransport>,
        sink: Arc<dyn RecordSink>,
        policy: BackoffPolicy,
    ) -> Self {
        let (state, _) = watch::channel(WatchState::Starting);
        Self {
            target,
            transport,
            sink,
            policy,
            state,
            resume: None,
            failures: 0,
            unexpected: 0,
        }
    }

    /// The watched collection.
    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Subscribe to state changes.
    pub fn state(&self) -> watch::Receiver<WatchState> {
        self.state.subscribe()
    }

    /// Run until the watch is forbidden or its retry budget is exhausted.
    ///
    /// Never returns `Ok`; cancel by dropping or aborting the future.
    pub async fn run(mut self) -> FleetResult<()> {
        loop {
            self.set_state(WatchState::Starting);
            let outcome = self.connect().await;

            let delay = match outcome {
                Outcome::Ended => {
                    trace!(target = %self.target, "watch ended, resuming");
                    counter!("fleet_watch_restarts_total", "reason" => "ended").increment(1);
                    continue;
                }
                Outcome::Forbidden => {
                    self.set_state(WatchState::Forbidden);
                    warn!(target = %self.target, "watch forbidden, not retrying");
                    return Err(FleetError::WatchForbidden {
                        target: self.target.to_string(),
                    });
                }
                Outcome::NotFound => {
                    debug!(target = %self.target, "watched kind not found");
                    self.policy.not_found_delay()
                }
                Outcome::RateLimited(retry_after) => {
                    let backoff = self.transient_delay("status 429")?;
                    retry_after.unwrap_or(backoff)
                }
                Outcome::Transient(reason) => self.transient_delay(&reason)?,
                Outcome::Unexpected(status) => {
                    warn!(target = %self.target, status, "unexpected watch status");
                    let delay = self.policy.delay(self.unexpected);
                    self.unexpected = self.unexpected.saturating_add(1);
                    delay
                }
            };

            counter!("fleet_watch_restarts_total", "reason" => "backoff").increment(1);
            self.set_state(WatchState::Backoff);
            debug!(target = %self.target, delay_ms = delay.as_millis() as u64, "watch backing off");
            sleep(delay).await;
        }
    }

    fn transient_delay(&mut self, reason: &str) -> FleetResult<Duration> {
        self.failures += 1;
        if self.failures > self.policy.max_retries {
            self.set_state(WatchState::Failed);
            warn!(
                target = %self.target,
                attempts = self.failures,
                reason,
                "watch retry budget exhausted"
            );
            return Err(FleetError::WatchFailed {
                target: self.target.to_string(),
                attempts: self.failures,
                reason: reason.to_string(),
            });
        }
        debug!(target = %self.target, attempt = self.failures, reason, "transient watch failure");
        Ok(self.policy.delay(self.failures - 1))
    }

    async fn connect(&mut self) -> Outcome {
        let path = self.target.path(self.resume.as_ref());
        let deadline = Instant::now() + self.policy.connection_timeout();

        let response = match timeout_at(deadline, self.transport.open(&path)).await {
            Err(_) => return Outcome::Transient("timed out waiting for response".to_string()),
            Ok(Err(e)) => return Outcome::Transient(e.to_string()),
            Ok(Ok(response)) => response,
        };

        match response.status {
            200 => {}
            403 => return Outcome::Forbidden,
            404 => return Outcome::NotFound,
            429 => return Outcome::RateLimited(response.retry_after),
            status @ (408 | 522 | 524 | 500..=599) => {
                return Outcome::Transient(format!("status {status}"))
            }
            status => return Outcome::Unexpected(status),
        }

        if self.failures > 0 || self.unexpected > 0 {
            info!(target = %self.target, "watch recovered");
        }
        self.failures = 0;
        self.unexpected = 0;
        self.set_state(WatchState::Watching);
        debug!(target = %self.target, resume = ?self.resume, "watch started");

        let mut body = response.body;
        let mut buffer = LineBuffer::new();
        loop {
            let chunk = match timeout_at(deadline, body.next()).await {
                Err(_) => {
                    trace!(target = %self.target, "watch connection lifetime reached");
                    return Outcome::Ended;
                }
                Ok(None) => return Outcome::Ended,
                Ok(Some(Err(e))) => return Outcome::Transient(e.to_string()),
                Ok(Some(Ok(chunk))) => chunk,
            };

            buffer.push(&chunk);
            let sink = &self.sink;
            let target = &self.target;
            let resume = &mut self.resume;
            buffer.drain_lines(|line| handle_line(target, sink.as_ref(), resume, line));
        }
    }

    fn set_state(&self, state: WatchState) {
        self.state.send_replace(state);
    }
}

fn handle_line(
    target: &WatchTarget,
    sink: &dyn RecordSink,
    resume: &mut Option<ResourceVersion>,
    line: &[u8],
) {
    let record = match WatchRecord::from_line(line) {
        Ok(record) => record,
        Err(e) => {
            warn!(target = %target, error = %e, "dropping unparseable watch line");
            return;
        }
    };

    if record.is_expired() {
        debug!(target = %target, "resource version expired, next watch starts fresh");
        *resume = None;
    }
    if let Some(version) = sink.apply(record) {
        *resume = Some(version);
    }
}
