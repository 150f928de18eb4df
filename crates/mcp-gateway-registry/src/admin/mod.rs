//! Admin API (C8): the registration/edit/toggle/rate/search REST
//! surface from SPEC_FULL.md §6. Every mutating handler follows the
//! same shape: admin check via C4 (except `rate`), validate, persist
//! via C3, notify C5/C6, append exactly one audit entry (C9).

pub mod agents;
pub mod search;
pub mod servers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::context::Context;

pub fn router() -> Router<Arc<Context>> {
    Router::new()
        .route("/api/servers/register", post(servers::register))
        .route("/api/servers", get(servers::list))
        .route(
            "/api/servers/{path}",
            get(servers::get).put(servers::edit).delete(servers::delete),
        )
        .route("/api/servers/{path}/toggle", post(servers::toggle))
        .route("/api/servers/{path}/rescan", post(servers::rescan))
        .route("/api/refresh/{path}", post(servers::refresh))
        .route("/api/servers/{path}/rate", post(servers::rate))
        .route("/api/agents/register", post(agents::register))
        .route("/api/agents", get(agents::list))
        .route(
            "/api/agents/{path}",
            get(agents::get).put(agents::edit).delete(agents::delete),
        )
        .route("/api/agents/{path}/toggle", post(agents::toggle))
        .route("/api/agents/{path}/rate", post(agents::rate))
        .route("/api/search", get(search::search))
}

use gateway_core::authz::{AdminAction, AuthorizationEngine};
use gateway_core::model::{Decision, Identity, RecordPath};

use crate::error::{ApiError, ErrorCode};

/// Shared admin-check helper: every mutating handler except `rate`
/// calls this before touching storage.
pub fn require_admin(ctx: &Context, identity: &Identity, action: AdminAction) -> Result<(), ApiError> {
    match AuthorizationEngine::authorize_admin_action(&ctx.policy.current(), identity, action) {
        Decision::Allow => Ok(()),
        Decision::Deny(_) => Err(ApiError::forbidden(ErrorCode::Forbidden)),
    }
}

/// Canonicalize a raw URL path segment (as extracted by axum's
/// `{path}` matcher, with no leading slash) into the same
/// `RecordPath` form records are stored and scope-policy rules are
/// written under, so every downstream repository lookup and policy
/// comparison operates on one consistent identifier.
pub fn canonical_path(path: String) -> Result<String, ApiError> {
    Ok(RecordPath::new(path)
        .map_err(|e| ApiError::validation(e.to_string()))?
        .into())
}
