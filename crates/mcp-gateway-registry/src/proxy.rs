//! Reverse Proxy / Router (C7): the `/<server-path>/{mcp,sse}` entry
//! point. Implements the eight-step pipeline from SPEC_FULL.md §4.7
//! verbatim: lookup, token validation (done by the auth middleware
//! ahead of this handler), authorization, upstream forwarding with
//! header allowlisting, SSE passthrough, and exactly one audit entry
//! per call.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;

use gateway_core::authz::{AuthorizationEngine, McpCallRequest, Decision};
use gateway_core::model::{AuditAction, Decision as ModelDecision, DenyReason, Identity};
use gateway_core::audit::{entry, record_best_effort};

use crate::context::Context;
use crate::error::{ApiError, ErrorCode};
use crate::jsonrpc::parse_method;
use crate::middleware::RequestId;

const PASS_THROUGH_REQUEST_HEADERS: &[&str] = &["accept", "content-type", "mcp-session-id"];
const SESSION_HEADER: &str = "mcp-session-id";

pub async fn forward(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Path(rest): Path<String>,
    request: Request,
) -> Response {
    match forward_inner(ctx, identity, request_id, rest, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn forward_inner(
    ctx: Arc<Context>,
    identity: Arc<Identity>,
    request_id: RequestId,
    rest: String,
    request: Request,
) -> Result<Response, ApiError> {
    let (server_path, transport) = split_server_path(&rest).ok_or_else(|| ApiError::not_found("server"))?;

    let server = ctx
        .servers
        .get(&server_path)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found(server_path.clone()).with_request_id(request_id.0.clone()))?;

    if !server.enabled {
        let err = ApiError::new(StatusCode::SERVICE_UNAVAILABLE, ErrorCode::ServerDisabled, "server disabled")
            .with_request_id(request_id.0.clone());
        audit(&ctx, &identity, &server_path, ModelDecision::Deny { reason: DenyReason::ServerDisabled }, Some(&request_id)).await;
        return Err(err);
    }

    let method = request.method().clone();
    let headers = request.headers().clone();
    let body_bytes = axum::body::to_bytes(request.into_body(), 16 * 1024 * 1024)
        .await
        .map_err(|e| ApiError::validation(format!("failed to read request body: {e}")))?;

    let mcp_method = parse_method(&body_bytes)
        .ok_or_else(|| ApiError::validation("request body is not a valid JSON-RPC envelope"))?;

    let call = McpCallRequest {
        server_path: &server_path,
        method: mcp_method,
    };
    let decision = AuthorizationEngine::authorize_mcp_call(&ctx.policy.current(), &identity, &call, true);

    if let Decision::Deny(reason) = decision {
        audit(&ctx, &identity, &server_path, ModelDecision::Deny { reason }, Some(&request_id)).await;
        let code = match reason {
            DenyReason::ToolNotPermitted => ErrorCode::ToolNotPermitted,
            _ => ErrorCode::MethodNotPermitted,
        };
        return Err(ApiError::forbidden(code).with_request_id(request_id.0.clone()));
    }

    let wants_sse = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"));

    let upstream_url = server
        .proxy_pass_url
        .join(transport)
        .map_err(|e| ApiError::internal(format!("invalid upstream url: {e}")))?;

    let mut upstream_headers = HeaderMap::new();
    for name in PASS_THROUGH_REQUEST_HEADERS {
        if let Some(value) = headers.get(*name) {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                upstream_headers.insert(name, value);
            }
        }
    }
    for template in &server.headers {
        let resolved = template.resolve();
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(template.name.as_bytes()),
            HeaderValue::from_str(&resolved),
        ) {
            upstream_headers.insert(name, value);
        }
    }

    let upstream_request = ctx
        .upstream
        .request(convert_method(&method), upstream_url)
        .headers(upstream_headers)
        .body(body_bytes.to_vec())
        .timeout(ctx.config.idle_read_timeout)
        .build()
        .map_err(|e| ApiError::internal(format!("failed to build upstream request: {e}")))?;

    let upstream_response = ctx.upstream.execute(upstream_request).await;

    let response = match upstream_response {
        Ok(response) => response,
        Err(e) => {
            audit(&ctx, &identity, &server_path, ModelDecision::Allow, Some(&request_id)).await;
            return Err(ApiError::upstream(StatusCode::BAD_GATEWAY, e.to_string())
                .with_request_id(request_id.0.clone()));
        }
    };

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let session_id = response
        .headers()
        .get(SESSION_HEADER)
        .cloned();

    audit(&ctx, &identity, &server_path, ModelDecision::Allow, Some(&request_id)).await;

    let mut builder = Response::builder().status(status);
    if let Some(session_id) = session_id {
        builder = builder.header(SESSION_HEADER, session_id);
    }
    if let Some(content_type) = response.headers().get(axum::http::header::CONTENT_TYPE) {
        builder = builder.header(axum::http::header::CONTENT_TYPE, content_type);
    }

    let body = if wants_sse {
        Body::from_stream(response.bytes_stream().map(|chunk| match chunk {
            Ok(bytes) => Ok::<Bytes, std::io::Error>(bytes),
            Err(e) => {
                tracing::warn!(error = %e, "upstream stream error, emitting terminal SSE error frame");
                let frame = format!(
                    "event: error\ndata: {{\"error\":{{\"code\":\"upstream_error\",\"message\":{:?}}}}}\n\n",
                    e.to_string()
                );
                Ok(Bytes::from(frame))
            }
        }))
    } else {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::upstream(StatusCode::BAD_GATEWAY, e.to_string()))?;
        Body::from(bytes)
    };

    builder
        .body(body)
        .map_err(|e| ApiError::internal(format!("failed to build response: {e}")))
}

async fn audit(
    ctx: &Context,
    identity: &Identity,
    server_path: &str,
    decision: ModelDecision,
    request_id: Option<&RequestId>,
) {
    record_best_effort(
        &ctx.audit,
        entry(
            identity.subject.clone(),
            AuditAction::McpCall,
            server_path.to_string(),
            decision,
            request_id.map(|r| r.0.clone()),
        ),
    )
    .await;
}

/// Splits the request path into a canonical `RecordPath`-form server
/// path (leading slash, matching the form servers are registered and
/// scope-policy rules are written under) plus the trailing transport
/// segment.
fn split_server_path(rest: &str) -> Option<(String, &'static str)> {
    let mut segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    let last = segments.pop()?;
    let transport = match last {
        "mcp" => "mcp",
        "sse" => "sse",
        _ => return None,
    };
    if segments.is_empty() {
        return None;
    }
    Some((format!("/{}", segments.join("/")), transport))
}

fn convert_method(method: &Method) -> reqwest::Method {
    reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::POST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use gateway_core::config::GatewayConfig;
    use gateway_core::model::{HealthStatus, RecordPath, ServerRecord, Transport};
    use gateway_core::repository::Precondition;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::context::Context;

    fn identity(groups: &[&str]) -> Arc<Identity> {
        Arc::new(Identity {
            subject: "user-1".to_string(),
            display_name: None,
            groups: groups.iter().map(|s| s.to_string()).collect(),
            token_expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            raw_claims: serde_json::json!({}),
        })
    }

    fn sample_server(path: &str, upstream: &str) -> ServerRecord {
        ServerRecord {
            path: RecordPath::new(path).unwrap(),
            server_name: "Current Time".to_string(),
            description: "returns the current time".to_string(),
            proxy_pass_url: url::Url::parse(upstream).unwrap(),
            supported_transports: BTreeSet::from([Transport::StreamableHttp]),
            tags: BTreeSet::new(),
            headers: vec![],
            tool_list: vec![],
            resource_list: vec![],
            num_stars: Default::default(),
            license: None,
            is_python: false,
            enabled: true,
            health_status: HealthStatus::Unknown,
            last_checked_time: None,
        }
    }

    /// A policy granting every group listed in `groups` full access to
    /// every server/method/tool, written to a temp YAML file so
    /// `PolicyStore::load` can read it back.
    async fn permissive_context(dir: &tempfile::TempDir) -> Arc<Context> {
        let mut config = GatewayConfig::default();
        config.storage.data_dir = dir.path().join("data");
        config.scope_policy_path = dir.path().join("scope_policy.yaml");
        config.audit_log_path = dir.path().join("audit.jsonl");
        std::fs::write(
            &config.scope_policy_path,
            "group_mappings:\n  lob1: [\"lob1-ro\"]\nmcp_server_scopes:\n  lob1-ro:\n    - server: \"*\"\n      methods: [\"*\"]\n      tools: [\"*\"]\n",
        )
        .unwrap();
        Context::build(config).await.unwrap()
    }

    fn deny_policy_context_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("scope_policy.yaml");
        std::fs::write(&path, "group_mappings: {}\n").unwrap();
        path
    }

    /// S1 -- permitted tool call returns the upstream's JSON body
    /// unchanged and records exactly one allow audit entry.
    #[tokio::test]
    async fn s1_permitted_tool_call_returns_upstream_json() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {"time": "2025-01-01T00:00:00Z"},
            })))
            .mount(&upstream)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let ctx = permissive_context(&dir).await;
        let server = sample_server("/currenttime", &upstream.uri());
        ctx.servers.put(server, Precondition::Any).await.unwrap();

        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "current_time_by_timezone", "arguments": {"tz_name": "UTC"}},
        });
        let request = Request::builder()
            .method("POST")
            .uri("/currenttime/mcp")
            .header(axum::http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = forward_inner(
            ctx,
            identity(&["lob1"]),
            RequestId("req-1".to_string()),
            "currenttime/mcp".to_string(),
            request,
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["result"]["time"], "2025-01-01T00:00:00Z");
    }

    /// S2 -- forbidden tool call never reaches the upstream and
    /// returns 403 with the generic `method_not_permitted` reason.
    #[tokio::test]
    async fn s2_forbidden_tool_call_is_rejected_before_forwarding() {
        let upstream = MockServer::start().await;
        // No mock registered: if the gateway forwarded anyway this
        // request would fail with a connection-level mismatch.

        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        config.storage.data_dir = dir.path().join("data");
        config.scope_policy_path = deny_policy_context_path(&dir);
        config.audit_log_path = dir.path().join("audit.jsonl");
        let ctx = Context::build(config).await.unwrap();

        let server = sample_server("/currenttime", &upstream.uri());
        ctx.servers.put(server, Precondition::Any).await.unwrap();

        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": {"name": "current_time_by_timezone", "arguments": {}},
        });
        let request = Request::builder()
            .method("POST")
            .uri("/currenttime/mcp")
            .header(axum::http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = forward_inner(
            ctx,
            identity(&["lob2"]),
            RequestId("req-2".to_string()),
            "currenttime/mcp".to_string(),
            request,
        )
        .await;

        let err = response.unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    /// S6 -- SSE passthrough: both frames forwarded in order with
    /// their blank-line separators intact.
    #[tokio::test]
    async fn s6_sse_streaming_preserves_frame_order() {
        let upstream = MockServer::start().await;
        let sse_body = "data: {\"seq\":1}\n\ndata: {\"seq\":2}\n\n";
        Mock::given(method("POST"))
            .and(path("/sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(sse_body.to_string(), "text/event-stream"),
            )
            .mount(&upstream)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let ctx = permissive_context(&dir).await;
        let server = sample_server("/sre-gateway", &upstream.uri());
        ctx.servers.put(server, Precondition::Any).await.unwrap();

        let body = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        let request = Request::builder()
            .method("POST")
            .uri("/sre-gateway/sse")
            .header(axum::http::header::ACCEPT, "text/event-stream")
            .header(axum::http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = forward_inner(
            ctx,
            identity(&["lob1"]),
            RequestId("req-3".to_string()),
            "sre-gateway/sse".to_string(),
            request,
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        assert_eq!(bytes.as_ref(), sse_body.as_bytes());
    }

    /// Disabled servers return 503 and never reach the upstream.
    #[tokio::test]
    async fn disabled_server_returns_service_unavailable() {
        let upstream = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let ctx = permissive_context(&dir).await;
        let mut server = sample_server("/currenttime", &upstream.uri());
        server.enabled = false;
        ctx.servers.put(server, Precondition::Any).await.unwrap();

        let body = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        let request = Request::builder()
            .method("POST")
            .uri("/currenttime/mcp")
            .body(Body::from(body.to_string()))
            .unwrap();

        let err = forward_inner(
            ctx,
            identity(&["lob1"]),
            RequestId("req-4".to_string()),
            "currenttime/mcp".to_string(),
            request,
        )
        .await
        .unwrap_err();

        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
