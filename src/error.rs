//! Error types for polyroute.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type alias for polyroute operations.
pub type Result<T> = std::result::Result<T, Error>;

/// One failed attempt inside a dispatch chain.
///
/// Collected per candidate so that an exhausted chain can report which
/// providers were tried and why each failed.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttemptFailure {
    pub provider: String,
    /// Error category: "timeout", "connect", "status", "transport".
    pub kind: String,
    pub detail: String,
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.provider, self.kind, self.detail)
    }
}

/// Main error type for polyroute.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Every configured provider is unhealthy; nothing to rank.
    #[error("No providers available")]
    NoProvidersAvailable,

    /// The ranked candidate list was exhausted without a success.
    #[error("All {} attempted providers failed", attempts.len())]
    AllProvidersFailed { attempts: Vec<AttemptFailure> },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            Error::NoProvidersAvailable => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Error::AllProvidersFailed { .. } => (StatusCode::BAD_GATEWAY, self.to_string()),
            Error::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            Error::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        // Aggregated error body; attempted providers are listed individually
        // so the caller can see why each candidate failed.
        let body = match &self {
            Error::AllProvidersFailed { attempts } => serde_json::json!({
                "error": {
                    "message": message,
                    "type": "polyroute_error",
                    "code": status.as_u16(),
                    "attempts": attempts,
                }
            }),
            _ => serde_json::json!({
                "error": {
                    "message": message,
                    "type": "polyroute_error",
                    "code": status.as_u16(),
                }
            }),
        };

        (status, axum::Json(body)).into_response()
    }
}
