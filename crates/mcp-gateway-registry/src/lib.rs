//! The `mcp-gateway-registry` binary crate: token validation (C2),
//! the reverse proxy (C7), the admin API (C8), and request-scoped
//! audit logging (C9) wired into a single `axum::Router`, following
//! the teacher's `server/states/starting.rs` router-assembly shape.

pub mod admin;
pub mod context;
pub mod error;
pub mod jsonrpc;
pub mod middleware;
pub mod proxy;
pub mod telemetry;
pub mod token_validator;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use context::Context;

/// Build the full application router: public health check, the admin
/// API, and the catch-all reverse proxy, with request-id generation
/// and bearer-token authentication applied to every route except the
/// health check, plus CORS when enabled.
pub fn app(ctx: Arc<Context>) -> Router {
    let authenticated = Router::new()
        .merge(admin::router())
        .route("/{*rest}", axum::routing::any(proxy::forward))
        .route_layer(axum::middleware::from_fn_with_state(
            ctx.clone(),
            middleware::authenticate,
        ));

    let mut router = Router::new()
        .route("/healthz", get(health_check))
        .merge(authenticated)
        .layer(axum::middleware::from_fn(middleware::request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx.clone());

    if ctx.config.cors.enabled {
        match ctx.config.cors.build_cors_layer() {
            Ok(cors) => router = router.layer(cors),
            Err(e) => tracing::warn!(error = %e, "cors enabled but misconfigured, leaving it off"),
        }
    }

    router
}

async fn health_check() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_context() -> Arc<Context> {
        let dir = tempfile::tempdir().unwrap();
        let mut config = gateway_core::config::GatewayConfig::default();
        config.storage.data_dir = dir.path().join("data");
        config.scope_policy_path = dir.path().join("scope_policy.yaml");
        config.audit_log_path = dir.path().join("audit.jsonl");
        std::fs::write(&config.scope_policy_path, "group_mappings: {}\n").unwrap();
        Context::build(config).await.unwrap()
    }

    #[tokio::test]
    async fn health_check_does_not_require_authentication() {
        let ctx = test_context().await;
        let router = app(ctx);
        let response = router
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn admin_routes_require_a_bearer_token() {
        let ctx = test_context().await;
        let router = app(ctx);
        let response = router
            .oneshot(Request::builder().uri("/api/servers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::UNAUTHORIZED);
    }
}
