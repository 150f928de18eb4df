//! Top-level gateway configuration: storage backend selection,
//! namespace, OIDC/JWKS settings, discovery weights and health-check
//! tuning. Loaded via `figment` (YAML file + environment overlay),
//! matching the teacher's config-layering approach.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use schemars::JsonSchema;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;

fn default_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum StorageBackend {
    /// One JSON file per record under a local directory.
    #[default]
    Filesystem,
    /// Records stored as documents in an embedded search index.
    SearchIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Key prefix applied uniformly to storage locations to isolate
    /// tenants (SPEC_FULL.md Glossary: Namespace).
    pub namespace: String,
    pub data_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Filesystem,
            namespace: default_namespace(),
            data_dir: PathBuf::from("./data"),
            cache_ttl: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct OidcConfig {
    pub issuer: Url,
    pub jwks_url: Url,
    pub audiences: Vec<String>,
    pub groups_claim: String,
    #[serde(with = "humantime_serde")]
    pub jwks_refresh_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub token_cache_cap: Duration,
    /// Client secret used only if this gateway itself needs to
    /// authenticate to the issuer (e.g. token introspection); never
    /// logged, never serialized back out.
    #[serde(skip_serializing)]
    pub client_secret: Option<SecretString>,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer: Url::parse("https://example-issuer.invalid/").expect("valid url"),
            jwks_url: Url::parse("https://example-issuer.invalid/.well-known/jwks.json")
                .expect("valid url"),
            audiences: vec![],
            groups_claim: "groups".to_string(),
            jwks_refresh_interval: Duration::from_secs(600),
            token_cache_cap: Duration::from_secs(300),
            client_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub embedding_dim: usize,
    pub weight_bm25: f64,
    pub weight_knn: f64,
    pub default_top_k_services: usize,
    pub default_top_n_tools: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 384,
            weight_bm25: 0.4,
            weight_knn: 0.6,
            default_top_k_services: 5,
            default_top_n_tools: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct HealthMonitorConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    pub max_concurrent_probes: usize,
    pub max_consecutive_failures_before_backoff: u32,
    #[serde(with = "humantime_serde")]
    pub max_backoff_interval: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(10),
            max_concurrent_probes: 32,
            max_consecutive_failures_before_backoff: 3,
            max_backoff_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ListenConfig {
    pub address: IpAddr,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub origins: Vec<String>,
    pub allow_credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            origins: Vec::new(),
            allow_credentials: false,
        }
    }
}

impl CorsConfig {
    /// Build a `tower_http::cors::CorsLayer` from this configuration,
    /// matching the teacher's `CorsConfig::build_cors_layer` shape but
    /// scaled to the gateway's simpler origin-list-only policy.
    pub fn build_cors_layer(&self) -> Result<tower_http::cors::CorsLayer, ConfigError> {
        let mut cors = tower_http::cors::CorsLayer::new()
            .allow_credentials(self.allow_credentials)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any);

        if self.origins.iter().any(|o| o == "*") {
            cors = cors.allow_origin(tower_http::cors::Any);
        } else {
            let mut origins = Vec::with_capacity(self.origins.len());
            for origin in &self.origins {
                let value = origin
                    .parse::<http::HeaderValue>()
                    .map_err(|e| ConfigError::Cors(format!("invalid origin `{origin}`: {e}")))?;
                origins.push(value);
            }
            cors = cors.allow_origin(origins);
        }
        Ok(cors)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: ListenConfig,
    pub storage: StorageConfig,
    pub scope_policy_path: PathBuf,
    pub oidc: OidcConfig,
    pub discovery: DiscoveryConfig,
    pub health_check: HealthMonitorConfig,
    pub cors: CorsConfig,
    pub audit_log_path: PathBuf,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_read_timeout: Duration,
    pub upstream_pool_size: usize,
    #[serde(with = "humantime_serde")]
    pub upstream_idle_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            storage: StorageConfig::default(),
            scope_policy_path: PathBuf::from("./config/scope_policy.yaml"),
            oidc: OidcConfig::default(),
            discovery: DiscoveryConfig::default(),
            health_check: HealthMonitorConfig::default(),
            cors: CorsConfig::default(),
            audit_log_path: PathBuf::from("./data/audit.jsonl"),
            request_timeout: Duration::from_secs(60),
            idle_read_timeout: Duration::from_secs(60),
            upstream_pool_size: 32,
            upstream_idle_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] figment::Error),
    #[error("invalid CORS configuration: {0}")]
    Cors(String),
}

/// Load configuration from an optional YAML file layered under
/// environment variables prefixed `MCP_GATEWAY_` (e.g.
/// `MCP_GATEWAY_LISTEN.PORT=9000`), falling back to defaults for
/// anything unset -- matching the teacher's `read_config`/
/// `read_config_from_env` split in `main.rs`.
pub fn load(path: Option<&std::path::Path>) -> Result<GatewayConfig, ConfigError> {
    use figment::Figment;
    use figment::providers::{Env, Format, Serialized, Yaml};

    let mut figment = Figment::from(Serialized::defaults(GatewayConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Yaml::file(path));
    }
    figment = figment.merge(Env::prefixed("MCP_GATEWAY_").split("__"));
    Ok(figment.extract()?)
}
