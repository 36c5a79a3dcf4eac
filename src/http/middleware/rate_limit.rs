//! Rate limiting middleware.
//! Spends one point per request against the client IP.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::gateway::Gateway;
use crate::security::rate_limit::{HEADER_LIMIT, HEADER_REMAINING};

/// Identifier used when the connection address is not available.
const UNKNOWN_CLIENT: &str = "unknown";

fn client_key(request: &Request<Body>) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

pub async fn rate_limit_middleware(
    State(gateway): State<Arc<Gateway>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = client_key(&request);

    match gateway.admit(&key).await {
        Ok(quota) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(HEADER_LIMIT, HeaderValue::from(quota.limit));
            headers.insert(HEADER_REMAINING, HeaderValue::from(quota.remaining));
            response
        }
        Err(exceeded) => {
            tracing::warn!(
                client = %key,
                retry_after_seconds = exceeded.retry_after_seconds,
                "Rate limit exceeded"
            );
            exceeded.into_response()
        }
    }
}
