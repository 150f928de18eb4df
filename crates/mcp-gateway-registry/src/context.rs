//! Startup-constructed, read-mostly state shared by every handler
//! (SPEC_FULL.md §9: "global mutable state becomes a single `Context`
//! constructed at startup and passed by reference").

use std::sync::Arc;
use std::time::Duration;

use gateway_core::audit::{AuditSink, FileAuditSink};
use gateway_core::config::{GatewayConfig, StorageBackend};
use gateway_core::repository::fs::{FsAgentRepository, FsServerRepository};
use gateway_core::repository::tantivy_backend::{TantivyAgentRepository, TantivyServerRepository};
use gateway_core::repository::{AgentRepository, ServerRepository};
use gateway_core::scope::PolicyStore;
use gateway_discovery::{DiscoveryIndex, HashEmbeddingProvider, HybridWeights};
use gateway_health::HealthMonitor;

use crate::token_validator::TokenValidator;

pub struct Context {
    pub config: GatewayConfig,
    pub servers: Arc<dyn ServerRepository>,
    pub agents: Arc<dyn AgentRepository>,
    pub discovery: Arc<DiscoveryIndex>,
    pub policy: Arc<PolicyStore>,
    pub audit: Arc<dyn AuditSink>,
    pub health: Arc<HealthMonitor>,
    pub tokens: Arc<TokenValidator>,
    pub upstream: reqwest::Client,
}

impl Context {
    pub async fn build(config: GatewayConfig) -> anyhow::Result<Arc<Self>> {
        let (servers, agents): (Arc<dyn ServerRepository>, Arc<dyn AgentRepository>) =
            match config.storage.backend {
                StorageBackend::Filesystem => {
                    let servers_dir = config.storage.data_dir.join("servers");
                    let agents_dir = config.storage.data_dir.join("agents");
                    (
                        Arc::new(FsServerRepository::open(servers_dir).await?),
                        Arc::new(FsAgentRepository::open(agents_dir).await?),
                    )
                }
                StorageBackend::SearchIndex => {
                    let servers_dir = config.storage.data_dir.join("servers-index");
                    let agents_dir = config.storage.data_dir.join("agents-index");
                    (
                        Arc::new(TantivyServerRepository::open_in_dir(
                            &servers_dir,
                            config.storage.cache_ttl,
                        )?),
                        Arc::new(TantivyAgentRepository::open_in_dir(
                            &agents_dir,
                            config.storage.cache_ttl,
                        )?),
                    )
                }
            };

        let weights = HybridWeights {
            bm25: config.discovery.weight_bm25,
            knn: config.discovery.weight_knn,
        };
        let embedder = Box::new(HashEmbeddingProvider::new(config.discovery.embedding_dim));
        let discovery = Arc::new(DiscoveryIndex::new(embedder, weights)?);
        reindex_all(&discovery, servers.as_ref(), agents.as_ref()).await?;

        let policy = Arc::new(PolicyStore::load(config.scope_policy_path.clone())?);
        let audit: Arc<dyn AuditSink> =
            Arc::new(FileAuditSink::open(config.audit_log_path.clone()).await?);
        let health = Arc::new(HealthMonitor::new(servers.clone(), config.health_check.clone()));
        let tokens = Arc::new(TokenValidator::new(config.oidc.clone()));

        let upstream = reqwest::Client::builder()
            .pool_max_idle_per_host(config.upstream_pool_size)
            .pool_idle_timeout(config.upstream_idle_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Arc::new(Self {
            config,
            servers,
            agents,
            discovery,
            policy,
            audit,
            health,
            tokens,
            upstream,
        }))
    }
}

/// Populate the discovery index from whatever is currently on disk, so
/// a restarted gateway doesn't serve an empty index until the next
/// mutation (SPEC_FULL.md §4.5 "a full rebuild is supported").
async fn reindex_all(
    discovery: &DiscoveryIndex,
    servers: &dyn ServerRepository,
    agents: &dyn AgentRepository,
) -> anyhow::Result<()> {
    let mut docs = Vec::new();
    for server in servers.list().await? {
        docs.extend(gateway_discovery::server_documents(&server));
    }
    for agent in agents.list().await? {
        docs.extend(gateway_discovery::agent_documents(&agent));
    }
    discovery.rebuild(docs)?;
    Ok(())
}

pub fn idle_read_timeout(ctx: &Context) -> Duration {
    ctx.config.idle_read_timeout
}
