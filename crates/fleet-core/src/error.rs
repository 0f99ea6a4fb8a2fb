//! Error types for stream service operations.
//!
//! This module provides [`FleetError`], the error type shared by the watch
//! adapter, the cache and the HTTP surface. It converts to an HTTP status code
//! for responses produced by the server crate.

/// Error type for stream service operations.
///
/// This error type is designed to:
/// - Cover all failure modes without using panics
/// - Convert to [`http::StatusCode`] for HTTP responses
/// - Tell transient upstream failures apart from permanent ones
/// - Support error chaining via the `source` field
///
/// # Example
///
/// ```rust
/// use fleet_core::FleetError;
///
/// fn require_name(name: Option<&str>) -> Result<&str, FleetError> {
///     name.ok_or_else(|| FleetError::InvalidRecord {
///         reason: "metadata.name is missing".to_string(),
///     })
/// }
///
/// assert!(require_name(None).is_err());
/// ```
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// A watch record or event payload is structurally unusable.
    #[error("invalid record: {reason}")]
    InvalidRecord {
        /// Reason why the record was rejected.
        reason: String,
    },

    /// A line from an upstream stream could not be decoded.
    #[error("decoding error in {context}: {message}")]
    Decode {
        /// Where the bytes came from (watch target, access review, ...).
        context: String,
        /// Error message.
        message: String,
    },

    /// The service account is not allowed to watch a resource type.
    #[error("watch forbidden for {target}")]
    WatchForbidden {
        /// The watch target that was refused.
        target: String,
    },

    /// A watch exhausted its retry budget.
    #[error("watch for {target} failed after {attempts} attempts: {reason}")]
    WatchFailed {
        /// The watch target.
        target: String,
        /// Number of consecutive failed attempts.
        attempts: u32,
        /// Last observed failure.
        reason: String,
    },

    /// An upstream HTTP call returned a non-success status.
    #[error("upstream returned status {status} for {target}")]
    UpstreamStatus {
        /// HTTP status code.
        status: u16,
        /// What was being requested.
        target: String,
    },

    /// Network level failure talking to the control plane.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Optional underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The authorization backend could not answer.
    #[error("authorization check failed: {message}")]
    Authorization {
        /// Error message.
        message: String,
        /// Optional underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The request carried no usable credentials.
    #[error("missing or invalid session token")]
    Unauthenticated,

    /// A client session can no longer be written to.
    #[error("session {session} closed")]
    SinkClosed {
        /// Session identifier.
        session: String,
    },

    /// Operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// Too many sessions or upstream throttling.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Rate limit message.
        message: String,
    },

    /// Service is shutting down.
    #[error("service is shutting down")]
    Shutdown,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unexpected internal error.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
        /// Optional underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl FleetError {
    /// Create an internal error from any error type.
    pub fn internal<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transport error from any error type.
    pub fn transport<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an authorization backend error from any error type.
    pub fn authorization<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Authorization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a decode error for bytes read from `context`.
    pub fn decode(context: impl Into<String>, err: &serde_json::Error) -> Self {
        Self::Decode {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FleetError::Transport { .. } | FleetError::Timeout { .. } => true,
            FleetError::UpstreamStatus { status, .. } => {
                matches!(status, 408 | 429 | 522 | 524) || (500..600).contains(status)
            }
            _ => false,
        }
    }
}

/// Convert to an HTTP status code for responses.
impl From<FleetError> for http::StatusCode {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::InvalidRecord { .. }
            | FleetError::Decode { .. }
            | FleetError::Configuration(_) => http::StatusCode::BAD_REQUEST,
            FleetError::Unauthenticated => http::StatusCode::UNAUTHORIZED,
            FleetError::WatchForbidden { .. } => http::StatusCode::FORBIDDEN,
            FleetError::RateLimited { .. } => http::StatusCode::SERVICE_UNAVAILABLE,
            FleetError::Shutdown => http::StatusCode::SERVICE_UNAVAILABLE,
            FleetError::Timeout { .. } => http::StatusCode::GATEWAY_TIMEOUT,
            FleetError::WatchFailed { .. }
            | FleetError::UpstreamStatus { .. }
            | FleetError::Transport { .. }
            | FleetError::Authorization { .. } => http::StatusCode::BAD_GATEWAY,
            FleetError::SinkClosed { .. } | FleetError::Internal { .. } => {
                http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
