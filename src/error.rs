//! Error taxonomy for the federation node

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

pub type FederationResult<T> = Result<T, FederationError>;

#[derive(Debug, Error)]
pub enum FederationError {
    /// Malformed or incomplete registration / message payload
    #[error("{0}")]
    Validation(String),

    /// No signature and no authenticated principal
    #[error("authentication required")]
    Unauthenticated,

    /// Signature missing a counterpart, malformed, or not matching any key
    #[error("invalid signature")]
    InvalidSignature,

    /// Authenticated principal without the required permission
    #[error("permission denied: {0}")]
    Forbidden(String),

    #[error("malformed key: {0}")]
    KeyFormat(String),

    /// Outbound call to a peer failed or timed out
    #[error("network error: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FederationError {
    pub fn status(&self) -> StatusCode {
        match self {
            FederationError::Validation(_) | FederationError::KeyFormat(_) => {
                StatusCode::BAD_REQUEST
            }
            FederationError::Unauthenticated => StatusCode::UNAUTHORIZED,
            FederationError::InvalidSignature | FederationError::Forbidden(_) => {
                StatusCode::FORBIDDEN
            }
            FederationError::Network(_) => StatusCode::BAD_GATEWAY,
            FederationError::Storage(_) | FederationError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<reqwest::Error> for FederationError {
    fn from(e: reqwest::Error) -> Self {
        FederationError::Network(e.to_string())
    }
}

impl From<std::io::Error> for FederationError {
    fn from(e: std::io::Error) -> Self {
        FederationError::Storage(e.to_string())
    }
}

impl IntoResponse for FederationError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("❌ {} -> {}", status, self);
        } else {
            log::warn!("⚠️ {} -> {}", status, self);
        }
        (status, Json(serde_json::json!({ "detail": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            FederationError::Validation("required fields missing".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(FederationError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(FederationError::InvalidSignature.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            FederationError::Forbidden("add_node".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            FederationError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_validation_message_passthrough() {
        let e = FederationError::Validation("invalid message".into());
        assert_eq!(e.to_string(), "invalid message");
    }
}
