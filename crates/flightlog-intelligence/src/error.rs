//! Error taxonomy for the HTTP surface.
//!
//! Low-level failures are converted into these typed outcomes at the
//! handler boundary. User-visible bodies never carry provider error
//! payloads or stack traces.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Missing or malformed client input (message, session id, SQL, log body).
    #[error("{0}")]
    Input(String),

    /// Unknown or TTL-evicted session id. The client should re-init.
    #[error("session not found or expired: {0}")]
    SessionExpired(String),

    /// Log ingestion failed outright (no tables could be produced).
    #[error("failed to ingest log: {0}")]
    Ingest(String),

    /// LLM or doc-fetch transport failure after retries were exhausted.
    #[error("the analysis service is temporarily unavailable")]
    Transport(#[source] anyhow::Error),

    /// Anything else. The detail stays in the logs.
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Input(_) => StatusCode::BAD_REQUEST,
            ServiceError::SessionExpired(_) => StatusCode::NOT_FOUND,
            ServiceError::Ingest(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Transport(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ServiceError::Transport(e) => tracing::error!("transport failure: {:#}", e),
            ServiceError::Internal(e) => tracing::error!("internal failure: {:#}", e),
            _ => {}
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(e: anyhow::Error) -> Self {
        ServiceError::Internal(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ServiceError::Input("missing message".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::SessionExpired("abc".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::Transport(anyhow::anyhow!("timeout")).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_internal_error_hides_detail() {
        let err = ServiceError::Internal(anyhow::anyhow!("secret provider body"));
        assert_eq!(err.to_string(), "internal error");
    }

    #[test]
    fn test_transport_error_is_generic() {
        let err = ServiceError::Transport(anyhow::anyhow!("connection refused to 10.0.0.1"));
        assert!(!err.to_string().contains("10.0.0.1"));
    }
}
