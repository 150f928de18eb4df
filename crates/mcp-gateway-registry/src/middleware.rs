//! Cross-cutting middleware: bearer-token authentication (wraps C2)
//! and request-id generation, applied the way the teacher's
//! `auth::enable_middleware` wraps its router with
//! `axum::middleware::from_fn_with_state`.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;
use uuid::Uuid;

use gateway_core::model::Identity;

use crate::context::Context;
use crate::error::{ApiError, ErrorCode};
use crate::token_validator::TokenError;

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4().to_string());
    request.extensions_mut().insert(id.clone());
    let mut response = next.run(request).await;
    if let Ok(value) = axum::http::HeaderValue::from_str(&id.0) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

#[tracing::instrument(skip_all, fields(status_code, reason))]
pub async fn authenticate(
    State(ctx): State<Arc<Context>>,
    token: Option<TypedHeader<Authorization<Bearer>>>,
    request_id: Option<axum::Extension<RequestId>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let rid = request_id.map(|e| e.0.0).unwrap_or_default();

    let token = token.ok_or_else(|| {
        tracing::Span::current().record("reason", "missing_token");
        ApiError::unauthorized(ErrorCode::InvalidToken, "missing bearer token").with_request_id(rid.clone())
    })?;

    let identity = ctx
        .tokens
        .validate(token.0.token())
        .await
        .map_err(|e| {
            tracing::Span::current().record("reason", tracing::field::debug(&e));
            map_token_error(e).with_request_id(rid.clone())
        })?;

    request.extensions_mut().insert(identity);
    let response = next.run(request).await;
    tracing::Span::current().record("status_code", response.status().as_u16());
    Ok(response)
}

fn map_token_error(e: TokenError) -> ApiError {
    let code = match e {
        TokenError::InvalidToken => ErrorCode::InvalidToken,
        TokenError::ExpiredToken => ErrorCode::ExpiredToken,
        TokenError::UnknownKey => ErrorCode::UnknownKey,
        TokenError::ClaimMissing(_) => ErrorCode::ClaimMissing,
        TokenError::Network(_) => ErrorCode::Network,
    };
    ApiError::unauthorized(code, e.to_string())
}

pub type IdentityExt = axum::Extension<Arc<Identity>>;
