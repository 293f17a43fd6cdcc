use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parley_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Domain verification failed: {0}")]
    DomainVerificationFailed(String),

    #[error("Instance is blocked")]
    InstanceBlocked,

    #[error("Instance has not been approved yet")]
    ApprovalNotYetGranted,

    #[error("Missing identity: {0}")]
    IdentityIncomplete(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Federation not enabled")]
    FederationDisabled,

    #[error("Peer unreachable: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::InvalidSignature
            | ServerError::DomainVerificationFailed(_)
            | ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServerError::InstanceBlocked
            | ServerError::ApprovalNotYetGranted
            | ServerError::Forbidden(_)
            | ServerError::FederationDisabled => StatusCode::FORBIDDEN,
            ServerError::IdentityIncomplete(_)
            | ServerError::PayloadTooLarge
            | ServerError::InvalidJson(_)
            | ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Network(_) => StatusCode::BAD_GATEWAY,
            ServerError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            ServerError::Store(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<reqwest::Error> for ServerError {
    fn from(e: reqwest::Error) -> Self {
        ServerError::Network(e.to_string())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ServerError::Store(StoreError::NotFound) => "Not found".to_string(),
            ServerError::Store(e) => {
                tracing::error!(error = %e, "storage failure");
                "Internal server error".to_string()
            }
            ServerError::Internal(e) => {
                tracing::error!(error = %e, "internal failure");
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
