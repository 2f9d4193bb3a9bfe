//! Upstream provider transport.
//!
//! The actual inference call is an opaque capability: send a request to
//! provider P, observe latency/success/cost. [`ProviderTransport`] is the
//! seam between the router and that capability; [`HttpTransport`] is the
//! production implementation, and tests substitute their own.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header;

use crate::config::{ApiKey, ProviderConfig};
use crate::dispatch::RouteRequest;

/// Static connection details for one provider, derived from config.
#[derive(Clone)]
pub struct ProviderEndpoint {
    pub id: usize,
    pub name: String,
    pub url: String,
    pub api_key: Option<ApiKey>,
}

impl ProviderEndpoint {
    /// Build the endpoint arena from config, in declaration order.
    pub fn from_config(providers: &[ProviderConfig]) -> Vec<Self> {
        providers
            .iter()
            .enumerate()
            .map(|(id, p)| Self {
                id,
                name: p.name.clone(),
                url: p.url.clone(),
                api_key: p.api_key.clone(),
            })
            .collect()
    }
}

impl std::fmt::Debug for ProviderEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEndpoint")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Errors from one upstream attempt. Timeouts are handled by the caller
/// (the dispatcher wraps attempts in its own deadline), so they do not
/// appear here.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to reach provider: {0}")]
    Connect(String),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Short category used in attempt failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Connect(_) => "connect",
            TransportError::Status { .. } => "status",
            TransportError::Malformed(_) => "transport",
        }
    }

    /// Whether the provider was reachable at all. A served error status
    /// still demonstrates availability; a connect failure does not.
    pub fn reachable(&self) -> bool {
        !matches!(self, TransportError::Connect(_))
    }
}

/// A successful upstream response with whatever usage data it reported.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub body: serde_json::Value,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

/// The opaque upstream capability.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    /// Forward an inference request to the provider.
    async fn send(
        &self,
        endpoint: &ProviderEndpoint,
        request: &RouteRequest,
    ) -> Result<UpstreamResponse, TransportError>;

    /// Lightweight liveness check; returns round-trip time on success.
    async fn probe(&self, endpoint: &ProviderEndpoint) -> Result<Duration, TransportError>;
}

/// Production transport over reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn send(
        &self,
        endpoint: &ProviderEndpoint,
        request: &RouteRequest,
    ) -> Result<UpstreamResponse, TransportError> {
        let url = format!("{}/completions", endpoint.url.trim_end_matches('/'));

        let mut upstream = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(request);

        if let Some(api_key) = &endpoint.api_key {
            upstream = upstream.header(
                header::AUTHORIZATION,
                format!("Bearer {}", api_key.expose_secret()),
            );
        }

        let response = upstream
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TransportError::Malformed(e.to_string()))?;

        let (input_tokens, output_tokens) = match extract_usage(&body) {
            Some((input, output)) => (Some(input), Some(output)),
            None => (None, None),
        };

        Ok(UpstreamResponse {
            body,
            input_tokens,
            output_tokens,
        })
    }

    async fn probe(&self, endpoint: &ProviderEndpoint) -> Result<Duration, TransportError> {
        let url = format!("{}/models", endpoint.url.trim_end_matches('/'));
        let start = Instant::now();

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: String::new(),
            });
        }

        Ok(start.elapsed())
    }
}

/// Extract token usage from a provider response.
///
/// Returns `(prompt_tokens, completion_tokens)` only when the usage object
/// is present and complete.
fn extract_usage(response: &serde_json::Value) -> Option<(u32, u32)> {
    let usage = response.get("usage")?;
    let input = usage.get("prompt_tokens")?.as_u64()? as u32;
    let output = usage.get("completion_tokens")?.as_u64()? as u32;
    Some((input, output))
}
