//! Hybrid tool/skill discovery endpoint (`GET /api/search`), the HTTP
//! face of C5. Applies C4's visibility filter to the query so a caller
//! never sees a tool or skill belonging to a server/agent they
//! couldn't otherwise list (SPEC_FULL.md §4.5 step 5).

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;

use gateway_core::authz::AuthorizationEngine;
use gateway_core::model::Identity;
use gateway_discovery::SearchResult;

use crate::context::Context;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub top_k_services: Option<usize>,
    pub top_n_tools: Option<usize>,
}

pub async fn search(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResult>, ApiError> {
    let top_k_services = query
        .top_k_services
        .unwrap_or(ctx.config.discovery.default_top_k_services);
    let top_n_tools = query
        .top_n_tools
        .unwrap_or(ctx.config.discovery.default_top_n_tools);

    let policy = ctx.policy.current();
    let identity = identity.as_ref();
    let visible = |path: &str| {
        let candidate = [path.to_string()];
        !AuthorizationEngine::filter_visible_servers(&policy, identity, &candidate).is_empty()
            || !AuthorizationEngine::filter_visible_agents(&policy, identity, &candidate).is_empty()
    };

    let result = ctx
        .discovery
        .search(&query.q, top_k_services, top_n_tools, visible);
    Ok(Json(result))
}
