//! HTTP surface: `/events`, `/livenessProbe` and `/readinessProbe`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use fleet_core::FleetError;
use futures::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::connections::{ConnectionGuard, ConnectionTracker};
use crate::encoder::{Encoding, StreamEncoder};
use crate::health::HealthService;
use crate::registry::SessionRegistry;
use crate::session::{ChannelSink, SessionFilter, SessionId};
use crate::shutdown::ShutdownController;

/// State shared by the handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Connected sessions.
    pub registry: Arc<SessionRegistry>,
    /// Stream admission.
    pub connections: ConnectionTracker,
    /// Probe state.
    pub health: HealthService,
    /// Shutdown state; new streams are refused once triggered.
    pub shutdown: ShutdownController,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    let mut router = Router::new().route("/events", get(events));
    if state.config.health.enabled {
        router = router
            .route("/livenessProbe", get(liveness))
            .route("/readinessProbe", get(readiness));
    }
    router.with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    events: Option<String>,
    namespaces: Option<String>,
}

/// Value of cookie `name` from the request's `Cookie` headers.
pub fn cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn error_response(err: FleetError) -> Response {
    let message = err.to_string();
    (StatusCode::from(err), message).into_response()
}

async fn events(
    State(state): State<AppState>,
    remote: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Response {
    if state.shutdown.is_shutdown() {
        return error_response(FleetError::Shutdown);
    }
    let Some(token) = cookie(&headers, &state.config.token_cookie) else {
        return error_response(FleetError::Unauthenticated);
    };

    let remote_addr = remote.map(|ConnectInfo(addr)| addr);
    let Some(slot) = state.connections.try_acquire(remote_addr) else {
        return error_response(FleetError::RateLimited {
            message: "too many event streams".to_string(),
        });
    };

    let accept = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok());
    let encoding = Encoding::negotiate(accept, &state.config.compression);
    let encoder = StreamEncoder::new(encoding, &state.config.compression);
    let filter = SessionFilter::from_query(query.events.as_deref(), query.namespaces.as_deref());

    let id = SessionId::new();
    let (sink, rx) = ChannelSink::channel(id, state.config.sink_capacity);
    state
        .registry
        .register(id, Arc::from(token), filter, encoder, Arc::new(sink));
    debug!(session = %id, remote = ?remote_addr, "event stream opened");

    let body = SessionStream {
        frames: ReceiverStream::new(rx),
        _guard: StreamGuard {
            registry: Arc::clone(&state.registry),
            id,
            _slot: slot,
        },
    };

    let mut response = Response::new(Body::from_stream(body));
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-transform"),
    );
    if let Some(value) = encoding.header_value() {
        response_headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(value));
    }
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; Secure; SameSite=Strict",
        state.config.session_cookie, id
    );
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            response_headers.insert(header::SET_COOKIE, value);
        }
        Err(e) => warn!(session = %id, error = %e, "invalid session cookie"),
    }
    response
}

/// Deregisters the session when the response body is dropped.
struct StreamGuard {
    registry: Arc<SessionRegistry>,
    id: SessionId,
    _slot: ConnectionGuard,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

struct SessionStream {
    frames: ReceiverStream<Bytes>,
    _guard: StreamGuard,
}

impl Stream for SessionStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.frames).poll_next(cx).map(|frame| frame.map(Ok))
    }
}

async fn liveness(State(state): State<AppState>) -> StatusCode {
    if state.health.is_live() {
        StatusCode::OK
    } else {
        warn!(failing = ?state.health.failing(), "liveness probe failed");
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.health.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
