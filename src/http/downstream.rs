//! HTTP-backed downstream actions.
//!
//! `POST {base_url}/{operation}` with the request payload as JSON, or
//! `POST {base_url}` for the service's default action. Non-2xx
//! answers become `DownstreamError::status`, socket failures are normalised
//! from the reqwest error chain.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::schema::DownstreamConfig;
use crate::gateway::Gateway;
use crate::resilience::circuit_breaker::{Action, DEFAULT_OPERATION};
use crate::resilience::error_classifier::DownstreamError;
use crate::resilience::Payload;

/// Longest error body echoed into an error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpAction {
    client: reqwest::Client,
    url: String,
}

impl HttpAction {
    pub fn new(client: reqwest::Client, config: &DownstreamConfig, operation: &str) -> Self {
        let base = config.base_url.trim_end_matches('/');
        let url = if operation == DEFAULT_OPERATION {
            base.to_string()
        } else {
            format!("{}/{}", base, operation)
        };
        Self { client, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Shared client for every downstream, honouring the optional client timeout.
pub fn build_client(config: &DownstreamConfig) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(ms) = config.timeout_ms {
        builder = builder.timeout(Duration::from_millis(ms));
    }
    builder.build()
}

/// Register an `HttpAction` for every configured downstream: the service
/// default plus one per listed operation. Returns how many were registered.
pub fn register_downstreams(gateway: &Gateway) -> Result<usize, reqwest::Error> {
    let mut registered = 0;
    for (service, config) in &gateway.config().downstream {
        let client = build_client(config)?;
        let operations = std::iter::once(DEFAULT_OPERATION).chain(config.operations.iter().map(String::as_str));
        for operation in operations {
            let action = HttpAction::new(client.clone(), config, operation);
            tracing::debug!(service = %service, operation = %operation, url = %action.url(), "Registered downstream");
            gateway.register_action(service, operation, std::sync::Arc::new(action));
            registered += 1;
        }
    }
    Ok(registered)
}

#[async_trait]
impl Action for HttpAction {
    async fn call(&self, request: Payload) -> Result<Payload, DownstreamError> {
        let response = self.client.post(&self.url).json(&request).send().await?;
        let status = response.status();

        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(DownstreamError::status(status.as_u16(), body));
        }

        if response.content_length() == Some(0) {
            return Ok(Payload::Null);
        }
        Ok(response.json::<Payload>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::error_classifier::{ErrorKind, TransportCode};

    fn config(base_url: &str) -> DownstreamConfig {
        DownstreamConfig {
            base_url: base_url.to_string(),
            timeout_ms: Some(500),
            operations: Vec::new(),
        }
    }

    #[test]
    fn test_url_joining() {
        let client = reqwest::Client::new();
        let action = HttpAction::new(client.clone(), &config("http://weather.internal/"), "search");
        assert_eq!(action.url(), "http://weather.internal/search");
        let action = HttpAction::new(client, &config("http://weather.internal/api"), DEFAULT_OPERATION);
        assert_eq!(action.url(), "http://weather.internal/api");
    }

    #[test]
    fn test_register_downstreams() {
        let mut gateway_config = crate::config::schema::GatewayConfig::default();
        let mut weather = config("http://weather.internal");
        weather.operations = vec!["forecast".to_string(), "search".to_string()];
        gateway_config.downstream.insert("weather".to_string(), weather);
        let gateway = Gateway::new(gateway_config);

        assert_eq!(register_downstreams(&gateway).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_refused_connection_is_transport_error() {
        let cfg = config("http://127.0.0.1:1");
        let action = HttpAction::new(build_client(&cfg).unwrap(), &cfg, "search");
        let err = action.call(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Transport(_)), "got {:?}", err);
        assert_ne!(err.kind, ErrorKind::Transport(TransportCode::BreakerOpen));
    }
}
