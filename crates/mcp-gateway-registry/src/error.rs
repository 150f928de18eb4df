//! The crate's single error type at the HTTP boundary: every handler
//! returns `Result<_, ApiError>`, and `ApiError` knows how to render
//! itself as the `{error:{code,message,request_id}}` envelope.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

use gateway_core::audit::AuditError;
use gateway_core::error::RepositoryError;
use gateway_core::repository::RatingOutcome;
use gateway_core::scope::PolicyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidToken,
    ExpiredToken,
    UnknownKey,
    ClaimMissing,
    Network,
    MethodNotPermitted,
    ToolNotPermitted,
    Forbidden,
    NotFound,
    ServerDisabled,
    Validation,
    Conflict,
    UpstreamError,
    Internal,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: ErrorCode,
    pub message: String,
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn unauthorized(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code, message)
    }

    /// Authorization denials never leak which rule was considered, per
    /// the gateway's error taxonomy -- the message is always generic.
    pub fn forbidden(code: ErrorCode) -> Self {
        Self::new(StatusCode::FORBIDDEN, code, "access denied")
    }

    pub fn not_found(target: impl Into<String>) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            ErrorCode::NotFound,
            format!("{} not found", target.into()),
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::Validation, message)
    }

    pub fn conflict(target: impl Into<String>) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            ErrorCode::Conflict,
            format!("{} already exists", target.into()),
        )
    }

    pub fn upstream(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, ErrorCode::UpstreamError, message)
            .with_upstream_status(status)
    }

    fn with_upstream_status(mut self, status: StatusCode) -> Self {
        self.message = format!("{} (upstream status {})", self.message, status);
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Internal,
            message,
        )
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(
                code = ?self.code,
                request_id = ?self.request_id,
                message = %self.message,
                "internal error"
            );
        }
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "request_id": self.request_id,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<RepositoryError> for ApiError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound { path, .. } => ApiError::not_found(path),
            RepositoryError::Conflict { path, .. } => ApiError::conflict(path),
            RepositoryError::VersionConflict { path } => {
                ApiError::conflict(format!("{path} (version)"))
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<RatingOutcome> for ApiError {
    fn from(e: RatingOutcome) -> Self {
        match e {
            RatingOutcome::Repository(e) => e.into(),
            RatingOutcome::InvalidRating(e) => ApiError::validation(e.to_string()),
        }
    }
}

impl From<AuditError> for ApiError {
    fn from(e: AuditError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<PolicyError> for ApiError {
    fn from(e: PolicyError) -> Self {
        ApiError::internal(e.to_string())
    }
}
