use std::collections::BTreeSet;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;

use gateway_core::authz::{AdminAction, AuthorizationEngine};
use gateway_core::model::{
    AgentRecord, AuditAction, Decision, HealthStatus, Identity, RecordPath, SkillDescriptor,
    TrustLevel, Visibility,
};
use gateway_core::audit::{entry, record_best_effort};
use gateway_core::repository::Precondition;

use crate::admin::{canonical_path, require_admin};
use crate::context::Context;
use crate::error::{ApiError, ErrorCode};
use crate::middleware::RequestId;

use super::servers::RateRequest;

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub path: String,
    pub name: String,
    pub description: String,
    pub url: url::Url,
    pub version: String,
    #[serde(default)]
    pub skills: Vec<SkillDescriptor>,
    #[serde(default)]
    pub security_schemes: Vec<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub visibility: Visibility,
    pub trust_level: TrustLevel,
}

impl RegisterAgentRequest {
    fn into_record(self, path: RecordPath) -> AgentRecord {
        AgentRecord {
            path,
            name: self.name,
            description: self.description,
            url: self.url,
            version: self.version,
            skills: self.skills,
            security_schemes: self.security_schemes,
            tags: self.tags,
            visibility: self.visibility,
            trust_level: self.trust_level,
            enabled: true,
            health_status: HealthStatus::Unknown,
            last_checked_time: None,
            num_stars: Default::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

async fn reindex_agent(ctx: &Context, agent: &AgentRecord) {
    if let Err(e) = ctx
        .discovery
        .upsert_server(agent.path.as_str(), gateway_discovery::agent_documents(agent))
    {
        tracing::warn!(path = %agent.path, error = %e, "failed to reindex agent after mutation");
    }
}

pub async fn register(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Json(body): Json<RegisterAgentRequest>,
) -> Result<(StatusCode, Json<AgentRecord>), ApiError> {
    require_admin(&ctx, &identity, AdminAction::RegisterAgent)?;

    let path = RecordPath::new(body.path.clone()).map_err(|e| ApiError::validation(e.to_string()))?;
    if ctx.agents.get(path.as_str()).await?.is_some() {
        return Err(ApiError::conflict(path.as_str()));
    }

    let record = body.into_record(path);
    ctx.agents.put(record.clone(), Precondition::Any).await?;
    reindex_agent(&ctx, &record).await;

    audit(&ctx, &identity, AuditAction::RegisterAgent, record.path.as_str(), Decision::Allow, &request_id).await;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn list(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
) -> Result<Json<Vec<AgentRecord>>, ApiError> {
    let records = ctx.agents.list().await?;
    let candidates: Vec<String> = records.iter().map(|r| r.path.as_str().to_string()).collect();
    let visible = AuthorizationEngine::filter_visible_agents(&ctx.policy.current(), &identity, &candidates);
    let visible: std::collections::HashSet<String> = visible.into_iter().collect();
    Ok(Json(
        records.into_iter().filter(|r| visible.contains(r.path.as_str())).collect(),
    ))
}

pub async fn get(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
    Path(path): Path<String>,
) -> Result<Json<AgentRecord>, ApiError> {
    let path = canonical_path(path)?;
    let record = ctx.agents.get(&path).await?.ok_or_else(|| ApiError::not_found(path.clone()))?;
    let visible = AuthorizationEngine::filter_visible_agents(&ctx.policy.current(), &identity, &[path.clone()]);
    if visible.is_empty() {
        return Err(ApiError::forbidden(ErrorCode::Forbidden));
    }
    Ok(Json(record))
}

pub async fn edit(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Path(path): Path<String>,
    Json(body): Json<RegisterAgentRequest>,
) -> Result<Json<AgentRecord>, ApiError> {
    require_admin(&ctx, &identity, AdminAction::EditAgent)?;

    let path = canonical_path(path)?;
    let existing = ctx.agents.get(&path).await?.ok_or_else(|| ApiError::not_found(path.clone()))?;
    let record_path = RecordPath::new(body.path.clone()).map_err(|e| ApiError::validation(e.to_string()))?;
    if record_path.as_str() != path {
        return Err(ApiError::validation("path cannot be changed via edit"));
    }

    let mut record = body.into_record(record_path);
    record.enabled = existing.enabled;
    record.health_status = existing.health_status;
    record.last_checked_time = existing.last_checked_time;
    record.num_stars = existing.num_stars;

    ctx.agents.put(record.clone(), Precondition::Any).await?;
    reindex_agent(&ctx, &record).await;

    audit(&ctx, &identity, AuditAction::EditAgent, &path, Decision::Allow, &request_id).await;
    Ok(Json(record))
}

pub async fn delete(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Path(path): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_admin(&ctx, &identity, AdminAction::DeleteAgent)?;
    let path = canonical_path(path)?;
    ctx.agents.delete(&path).await?;
    if let Err(e) = ctx.discovery.remove_server(&path) {
        tracing::warn!(path, error = %e, "failed to remove agent from discovery index");
    }
    audit(&ctx, &identity, AuditAction::DeleteAgent, &path, Decision::Allow, &request_id).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn toggle(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Path(path): Path<String>,
    Json(body): Json<ToggleRequest>,
) -> Result<Json<AgentRecord>, ApiError> {
    require_admin(&ctx, &identity, AdminAction::ToggleAgent)?;
    let path = canonical_path(path)?;
    let record = ctx.agents.toggle(&path, body.enabled).await?;
    reindex_agent(&ctx, &record).await;
    audit(&ctx, &identity, AuditAction::ToggleAgent, &path, Decision::Allow, &request_id).await;
    Ok(Json(record))
}

pub async fn rate(
    State(ctx): State<Arc<Context>>,
    axum::Extension(identity): axum::Extension<Arc<Identity>>,
    axum::Extension(request_id): axum::Extension<RequestId>,
    Path(path): Path<String>,
    Json(body): Json<RateRequest>,
) -> Result<Json<AgentRecord>, ApiError> {
    let path = canonical_path(path)?;
    let record = ctx.agents.rate(&path, body.rating).await?;
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
