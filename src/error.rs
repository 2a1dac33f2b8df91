//! Gateway error taxonomy and its HTTP mapping.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

use crate::normalize::ValidationError;
use crate::upstream::UpstreamError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("API key missing")]
    AuthMissing,

    #[error("Invalid API key")]
    AuthInvalid,

    #[error("{0}")]
    Validation(String),

    #[error("key registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ValidationError> for GatewayError {
    fn from(err: ValidationError) -> Self {
        GatewayError::Validation(err.0)
    }
}

impl GatewayError {
    /// Message safe to show callers. Registry and upstream internals stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::AuthMissing => "API key missing".into(),
            GatewayError::AuthInvalid => "Invalid API key".into(),
            GatewayError::Validation(msg) => msg.clone(),
            GatewayError::RegistryUnavailable(_) => "Key registry unavailable".into(),
            GatewayError::Upstream(_) => "Upstream inference failed".into(),
            GatewayError::Internal(_) => "Internal server error".into(),
        }
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AuthMissing => StatusCode::UNAUTHORIZED,
            GatewayError::AuthInvalid => StatusCode::FORBIDDEN,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::RegistryUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            GatewayError::Upstream(UpstreamError::Status { status, body }) => {
                tracing::warn!(upstream_status = status, upstream_body = %body, "upstream call failed");
            }
            GatewayError::Upstream(_)
            | GatewayError::RegistryUnavailable(_)
            | GatewayError::Internal(_) => {
                tracing::warn!(error = %self, "request failed");
            }
            _ => {}
        }
        HttpResponse::build(self.status_code())
            .json(json!({ "success": false, "error": self.public_message() }))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(GatewayError::AuthMissing.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::AuthInvalid.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::RegistryUnavailable("down".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let upstream = GatewayError::from(UpstreamError::Status {
            status: 500,
            body: "stack trace".into(),
        });
        assert_eq!(upstream.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(upstream.public_message(), "Upstream inference failed");
    }

    #[test]
    fn registry_details_are_not_public() {
        let err = GatewayError::RegistryUnavailable("redis://secret-host refused".into());
        assert!(!err.public_message().contains("secret-host"));
    }
}
