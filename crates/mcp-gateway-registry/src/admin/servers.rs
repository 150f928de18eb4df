use std::collections::BTreeSet;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use gateway_core::authz::{AdminAction, AuthorizationEngine};
use gateway_core::model::{
    AuditAction, Decision, HeaderTemplate, HealthStatus, Identity, RecordPath, ServerRecord,
    ToolDescriptor, Transport,
};
use gateway_core::audit::{entry, record_best_effort};
use gateway_core::repository::Precondition;

use crate::admin::{canonical_path, require_admin};
use crate::context::Context;
use crate::error::{ApiError, ErrorCode};
use crate::middleware::RequestId;

#[derive(Debug, Deserialize)]
pub struct RegisterServerRequest {
    pub path: String,
    pub server_name: String,
    pub description: String,
    pub proxy_pass_url: url::Url,
    #[serde(default)]
    pub supported_transports: BTreeSet<Transport>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub headers: Vec<HeaderTemplate>,
    #[serde(default)]
    pub tool_list: Vec<ToolDescriptor>,
    #[serde(default)]
    pub resource_list: Vec<String>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub is_python: bool,
}

impl RegisterServerRequest {
    fn into_record(self, path: RecordPath) -> ServerRecord {
        ServerRecord {
            path,
            server_name: self.server_name,
            description: self.description,
            proxy_pass_url: self.proxy_pass_url,
            supported_transports: self.supported_transports,
            tags: self.tags,
            headers: self.headers,
            tool_list: self.tool_list,
            resource_list: self.resource_list,
            num_stars: Default::default(),
            license: self.license,
            is_python: self.is_python,
            enabled: true,
            health_status: HealthStatus::Unknown,
            last_checked_time: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct RateRequest {
    pub rating: u8,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub path: String,
    pub status: HealthStatus,
}

fn validate_tools(tools: &[ToolDescriptor]) -> Result<(), ApiError> {
    for tool in tools {
        jsonschema::validator_for(&tool.schema)
            .map_err(|e| ApiError::validation(format!("tool `{}` schema invalid: {e}", tool.name)))?;
    }
    Ok(())
}

async fn reindex_server(ctx: &Context, server: &ServerRecord) {
    if let Err(e) = ctx
        .discovery
        .upsert_server(server.path.as_str(), gateway_discovery::server_documents(server))
    {
        tracing::warn!(path = %server.path, error = %e, "failed to reindex server after mutation");
    }
}

pub async fn register(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Json(body): Json<RegisterServerRequest>,
) -> Result<(StatusCode, Json<ServerRecord>), ApiError> {
    require_admin(&ctx, &identity, AdminAction::RegisterServer)?;
    validate_tools(&body.tool_list)?;

    let path = RecordPath::new(body.path.clone()).map_err(|e| ApiError::validation(e.to_string()))?;
    if ctx.servers.get(path.as_str()).await?.is_some() {
        return Err(ApiError::conflict(path.as_str()));
    }

    let record = body.into_record(path);
    ctx.servers.put(record.clone(), Precondition::Any).await?;
    reindex_server(&ctx, &record).await;
    ctx.health.refresh(record.path.as_str()).await.ok();

    audit(&ctx, &identity, AuditAction::RegisterServer, record.path.as_str(), Decision::Allow, &request_id).await;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn list(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
) -> Result<Json<Vec<ServerRecord>>, ApiError> {
    let records = ctx.servers.list().await?;
    let candidates: Vec<String> = records.iter().map(|r| r.path.as_str().to_string()).collect();
    let visible = AuthorizationEngine::filter_visible_servers(&ctx.policy.current(), &identity, &candidates);
    let visible: std::collections::HashSet<String> = visible.into_iter().collect();
    Ok(Json(
        records.into_iter().filter(|r| visible.contains(r.path.as_str())).collect(),
    ))
}

pub async fn get(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
    Path(path): Path<String>,
) -> Result<Json<ServerRecord>, ApiError> {
    let path = canonical_path(path)?;
    let record = ctx.servers.get(&path).await?.ok_or_else(|| ApiError::not_found(path.clone()))?;
    ensure_visible(&ctx, &identity, &path)?;
    Ok(Json(record))
}

fn ensure_visible(ctx: &Context, identity: &Identity, path: &str) -> Result<(), ApiError> {
    let visible = AuthorizationEngine::filter_visible_servers(&ctx.policy.current(), identity, &[path.to_string()]);
    if visible.is_empty() {
        Err(ApiError::forbidden(ErrorCode::Forbidden))
    } else {
        Ok(())
    }
}

pub async fn edit(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Path(path): Path<String>,
    Json(body): Json<RegisterServerRequest>,
) -> Result<Json<ServerRecord>, ApiError> {
    require_admin(&ctx, &identity, AdminAction::EditServer)?;
    validate_tools(&body.tool_list)?;

    let path = canonical_path(path)?;
    let existing = ctx.servers.get(&path).await?.ok_or_else(|| ApiError::not_found(path.clone()))?;
    let record_path = RecordPath::new(body.path.clone()).map_err(|e| ApiError::validation(e.to_string()))?;
    if record_path.as_str() != path {
        return Err(ApiError::validation("path cannot be changed via edit"));
    }

    let mut record = body.into_record(record_path);
    record.enabled = existing.enabled;
    record.health_status = existing.health_status;
    record.last_checked_time = existing.last_checked_time;
    record.num_stars = existing.num_stars;

    ctx.servers.put(record.clone(), Precondition::Any).await?;
    reindex_server(&ctx, &record).await;

    audit(&ctx, &identity, AuditAction::EditServer, &path, Decision::Allow, &request_id).await;
    Ok(Json(record))
}

pub async fn delete(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Path(path): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx, &identity, AdminAction::DeleteServer)?;
    let path = canonical_path(path)?;
    ctx.servers.delete(&path).await?;
    if let Err(e) = ctx.discovery.remove_server(&path) {
        tracing::warn!(path, error = %e, "failed to remove server from discovery index");
    }
    audit(&ctx, &identity, AuditAction::DeleteServer, &path, Decision::Allow, &request_id).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn toggle(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Path(path): Path<String>,
    Json(body): Json<ToggleRequest>,
) -> Result<Json<ServerRecord>, ApiError> {
    require_admin(&ctx, &identity, AdminAction::ToggleServer)?;
    let path = canonical_path(path)?;
    let record = ctx.servers.toggle(&path, body.enabled).await?;
    reindex_server(&ctx, &record).await;
    audit(&ctx, &identity, AuditAction::ToggleServer, &path, Decision::Allow, &request_id).await;
    Ok(Json(record))
}

pub async fn refresh(
    State(ctx): State<Arc<Context>>,
    axum::Extension(_identity): axum::Extension<Arc<Identity>>,
    Path(path): Path<String>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let path = canonical_path(path)?;
    let status = ctx
        .health
        .refresh(&path)
        .await
        .map_err(|e| match e {
            gateway_health::HealthMonitorError::NotFound(p) => ApiError::not_found(p),
            other => ApiError::internal(other.to_string()),
        })?;
    Ok(Json(RefreshResponse { path, status }))
}

pub async fn rescan(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Path(path): Path<String>,
) -> Result<Json<ServerRecord>, ApiError> {
    require_admin(&ctx, &identity, AdminAction::RescanServer)?;
    let path = canonical_path(path)?;
    let status = ctx
        .health
        .refresh(&path)
        .await
        .map_err(|e| match e {
            gateway_health::HealthMonitorError::NotFound(p) => ApiError::not_found(p),
            other => ApiError::internal(other.to_string()),
        })?;
    let record = ctx.servers.get(&path).await?.ok_or_else(|| ApiError::not_found(path.clone()))?;
    reindex_server(&ctx, &record).await;
    tracing::info!(path, ?status, "rescan probed server and refreshed discovery index");
    audit(&ctx, &identity, AuditAction::RescanServer, &path, Decision::Allow, &request_id).await;
    Ok(Json(record))
}

pub async fn rate(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Path(path): Path<String>,
    Json(body): Json<RateRequest>,
) -> Result<Json<ServerRecord>, ApiError> {
    let path = canonical_path(path)?;
    let record = ctx.servers.rate(&path, body.rating).await?;
    audit(&ctx, &identity, AuditAction::Rate, &path, Decision::Allow, &request_id).await;
    Ok(Json(record))
}

async fn audit(
    ctx: &Context,
    identity: &Identity,
    action: AuditAction,
    target: &str,
    decision: Decision,
    request_id: &RequestId,
) {
    record_best_effort(
        &ctx.audit,
        entry(identity.subject.clone(), action, target.to_string(), decision, Some(request_id.0.clone())),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;

    async fn test_context() -> Arc<Context> {
        let dir = tempfile::tempdir().unwrap();
        let mut config = gateway_core::config::GatewayConfig::default();
        config.storage.data_dir = dir.path().join("data");
        config.scope_policy_path = dir.path().join("scope_policy.yaml");
        config.audit_log_path = dir.path().join("audit.jsonl");
        std::fs::write(
            &config.scope_policy_path,
            "group_mappings:\n  admins: [\"registry-admins\"]\n",
        )
        .unwrap();
        Context::build(config).await.unwrap()
    }

    fn admin_identity() -> Arc<Identity> {
        Arc::new(Identity {
            subject: "admin-1".to_string(),
            display_name: None,
            groups: vec!["admins".to_string()],
            token_expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            raw_claims: serde_json::json!({}),
        })
    }

    fn register_request(path: &str) -> RegisterServerRequest {
        RegisterServerRequest {
            path: path.to_string(),
            server_name: "Current Time".to_string(),
            description: "returns the current time".to_string(),
            // Loopback, closed port: the register handler's best-effort
            // health refresh fails fast (connection refused) instead of
            // waiting on a DNS lookup for an unresolvable hostname.
            proxy_pass_url: url::Url::parse("http://127.0.0.1:9/").unwrap(),
            supported_transports: BTreeSet::from([Transport::StreamableHttp]),
            tags: BTreeSet::new(),
            headers: vec![],
            tool_list: vec![],
            resource_list: vec![],
            license: None,
            is_python: false,
        }
    }

    /// Renaming a disabled server with a duplicate target path -> 409,
    /// per SPEC_FULL.md's boundary-case list.
    #[tokio::test]
    async fn register_duplicate_path_conflicts() {
        let ctx = test_context().await;
        let identity = admin_identity();
        let request_id = RequestId("req-1".to_string());

        register(
            State(ctx.clone()),
            axum::Extension(identity.clone()),
            axum::Extension(request_id.clone()),
            Json(register_request("/currenttime")),
        )
        .await
        .expect("first registration succeeds");

        let err = register(
            State(ctx),
            axum::Extension(identity),
            axum::Extension(request_id),
            Json(register_request("/currenttime")),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    /// Toggling a server off reindexes it as disabled rather than
    /// leaving the stale `enabled=true` document in the discovery index
    /// (S4: toggle + discovery).
    #[tokio::test]
    async fn toggle_off_removes_server_from_discovery() {
        let ctx = test_context().await;
        let identity = admin_identity();

        let mut request = register_request("/weather");
        request.tool_list = vec![ToolDescriptor {
            name: "get_forecast".to_string(),
            parsed_description: Default::default(),
            schema: serde_json::json!({"type": "object", "properties": {}}),
        }];

        register(
            State(ctx.clone()),
            axum::Extension(identity.clone()),
            axum::Extension(RequestId("req-1".to_string())),
            Json(request),
        )
        .await
        .unwrap();

        let before = ctx.discovery.search("get_forecast", 5, 5, |_| true);
        assert!(!before.services.is_empty(), "expected /weather to be found before toggling off");

        toggle(
            State(ctx.clone()),
            axum::Extension(identity),
            axum::Extension(RequestId("req-2".to_string())),
            Path("weather".to_string()),
            Json(ToggleRequest { enabled: false }),
        )
        .await
        .unwrap();

        let after = ctx.discovery.search("get_forecast", 5, 5, |_| true);
        assert!(after.services.is_empty(), "toggled-off server must not appear in search results");
    }

    /// Ratings fold into a running average rounded to one decimal
    /// place (SPEC_FULL.md Open Question #2 resolution).
    #[tokio::test]
    async fn rate_folds_into_running_average() {
        let ctx = test_context().await;
        let identity = admin_identity();

        register(
            State(ctx.clone()),
            axum::Extension(identity.clone()),
            axum::Extension(RequestId("req-1".to_string())),
            Json(register_request("/currenttime")),
        )
        .await
        .unwrap();

        rate(
            State(ctx.clone()),
            axum::Extension(identity.clone()),
            axum::Extension(RequestId("req-2".to_string())),
            Path("currenttime".to_string()),
            Json(RateRequest { rating: 5 }),
        )
        .await
        .unwrap();

        let record = rate(
            State(ctx),
            axum::Extension(identity),
            axum::Extension(RequestId("req-3".to_string())),
            Path("currenttime".to_string()),
            Json(RateRequest { rating: 3 }),
        )
        .await
        .unwrap();

        assert_eq!(record.num_stars.average, 4.0);
    }
}
