//! Gateway error taxonomy.
//!
//! Two of these reach the caller by design: `RateLimitExceeded` and
//! `CircuitOpen` / `ServiceUnavailable`. Everything else is the normalised
//! form of a downstream failure.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::resilience::error_classifier::{DownstreamError, ErrorKind, TransportCode};
use crate::security::rate_limit::RateLimitExceeded;

/// Result alias used across the crate.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Network-level failure talking to the downstream.
    #[error("transport failure ({code}): {message}")]
    Transport { code: TransportCode, message: String },

    /// 5xx-equivalent response from the downstream.
    #[error("downstream server error {status}: {message}")]
    DownstreamServer { status: u16, message: String },

    /// 4xx-equivalent response from the downstream.
    #[error("downstream client error {status}: {message}")]
    DownstreamClient { status: u16, message: String },

    /// The breaker rejected the call and no fallback payload was produced.
    #[error("circuit open for {key}")]
    CircuitOpen { key: String },

    /// A fallback declared that no safe degraded response exists.
    #[error("{service} is unavailable for {operation}: {message}")]
    ServiceUnavailable {
        service: String,
        operation: String,
        message: String,
    },

    #[error(transparent)]
    RateLimitExceeded(#[from] RateLimitExceeded),

    #[error("cache backend unavailable: {0}")]
    CacheBackendUnavailable(String),

    /// Configuration error: the service has no profile and no default exists.
    #[error("no breaker profile configured for service '{0}'")]
    UnknownService(String),

    /// Routing miss: nothing registered for `service/operation`.
    #[error("no downstream action registered for '{0}'")]
    UnknownAction(String),

    #[error("unclassified downstream error: {0}")]
    Unknown(String),
}

impl GatewayError {
    /// HTTP status a surrounding web layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Transport { code, .. } if *code == TransportCode::TimedOut => 504,
            GatewayError::Transport { .. } => 502,
            GatewayError::DownstreamServer { .. } => 502,
            GatewayError::DownstreamClient { status, .. } => *status,
            GatewayError::CircuitOpen { .. } | GatewayError::ServiceUnavailable { .. } => 503,
            GatewayError::RateLimitExceeded(_) => 429,
            GatewayError::CacheBackendUnavailable(_) => 503,
            GatewayError::UnknownService(_) | GatewayError::UnknownAction(_) => 404,
            GatewayError::Unknown(_) => 502,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::RateLimitExceeded(exceeded) = self {
            return exceeded.into_response();
        }
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

impl From<DownstreamError> for GatewayError {
    fn from(err: DownstreamError) -> Self {
        match err.kind {
            ErrorKind::Transport(code) => GatewayError::Transport {
                code,
                message: err.message,
            },
            ErrorKind::HttpStatus(status) if status >= 500 => GatewayError::DownstreamServer {
                status,
                message: err.message,
            },
            ErrorKind::HttpStatus(status) if status >= 400 => GatewayError::DownstreamClient {
                status,
                message: err.message,
            },
            ErrorKind::HttpStatus(_) | ErrorKind::Unknown => GatewayError::Unknown(err.message),
        }
    }
}
