use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::credentials::CredentialError;
use crate::oauth::OAuthError;
use crate::service::ServiceError;
use crate::supervisor::SupervisorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    InvalidRequest,
    AlreadyRunning,
    SpawnFailed,
    RosterIo,
    OAuthNotConfigured,
    OAuthRejected,
    OAuthUpstream,
    ListingFailed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::AlreadyRunning => "ALREADY_RUNNING",
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::RosterIo => "ROSTER_IO",
            ErrorCode::OAuthNotConfigured => "OAUTH_NOT_CONFIGURED",
            ErrorCode::OAuthRejected => "OAUTH_REJECTED",
            ErrorCode::OAuthUpstream => "OAUTH_UPSTREAM",
            ErrorCode::ListingFailed => "LISTING_FAILED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidRequest | ErrorCode::OAuthRejected => StatusCode::BAD_REQUEST,
            ErrorCode::AlreadyRunning => StatusCode::CONFLICT,
            ErrorCode::OAuthUpstream => StatusCode::BAD_GATEWAY,
            ErrorCode::OAuthNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::SpawnFailed
            | ErrorCode::RosterIo
            | ErrorCode::ListingFailed
            | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error body: `{"message": ..., "code": ...}`.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    pub code: &'static str,
    #[serde(skip)]
    status: StatusCode,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.as_str(),
            status: code.status_code(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, "{}", self.message);
        }
        (self.status, Json(self)).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let code = match &err {
            ServiceError::NotFound(_) => ErrorCode::NotFound,
            ServiceError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            ServiceError::Supervisor(SupervisorError::AlreadyRunning { .. }) => {
                ErrorCode::AlreadyRunning
            }
            ServiceError::Supervisor(SupervisorError::SpawnFailed { .. }) => ErrorCode::SpawnFailed,
            ServiceError::Roster(_) => ErrorCode::RosterIo,
            ServiceError::OAuth(OAuthError::NotConfigured | OAuthError::InvalidEndpoint(_)) => {
                ErrorCode::OAuthNotConfigured
            }
            ServiceError::OAuth(OAuthError::Exchange(_) | OAuthError::MissingEmail) => {
                ErrorCode::OAuthUpstream
            }
            ServiceError::OAuth(OAuthError::Credential(CredentialError::InvalidName(_))) => {
                ErrorCode::OAuthRejected
            }
            ServiceError::OAuth(OAuthError::Credential(_)) => ErrorCode::Internal,
            ServiceError::Listing(_) => ErrorCode::ListingFailed,
            ServiceError::Task(_) => ErrorCode::Internal,
        };
        let message = match err {
            // The dashboard matches on this text.
            ServiceError::NotFound(_) => "Not found".to_string(),
            other => other.to_string(),
        };
        ApiError::new(code, message)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(ErrorCode::InvalidRequest, rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn status_of(err: ServiceError) -> (StatusCode, &'static str) {
        let api = ApiError::from(err);
        (api.status(), api.code)
    }

    #[test]
    fn service_errors_map_to_statuses() {
        assert_eq!(
            status_of(ServiceError::NotFound("1".into())),
            (StatusCode::NOT_FOUND, "NOT_FOUND")
        );
        assert_eq!(
            status_of(ServiceError::InvalidRequest("bad".into())).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(SupervisorError::AlreadyRunning { port: 8001 }.into()).0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(
                SupervisorError::SpawnFailed {
                    port: 8001,
                    source: io::Error::from(io::ErrorKind::NotFound),
                }
                .into()
            )
            .0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(ServiceError::Roster(io::Error::other("disk full"))).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(OAuthError::NotConfigured.into()).0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(OAuthError::MissingEmail.into()).0,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(ServiceError::Listing("boom".into())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn not_found_body_is_stable() {
        let api = ApiError::from(ServiceError::NotFound("42".into()));
        let body = serde_json::to_value(&api).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"message": "Not found", "code": "NOT_FOUND"})
        );
    }
}
