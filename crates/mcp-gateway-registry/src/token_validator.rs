//! Token Validator (C2): verifies bearer JWTs against a configured
//! OIDC JWKS endpoint, extracts identity + groups, and caches decoded
//! claims by raw-token hash so repeat calls on the same token skip
//! signature verification.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::warn;

use gateway_core::config::OidcConfig;
use gateway_core::model::Identity;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("malformed or unparseable token")]
    InvalidToken,
    #[error("token has expired")]
    ExpiredToken,
    #[error("no matching signing key for this token's `kid`")]
    UnknownKey,
    #[error("required claim missing: {0}")]
    ClaimMissing(&'static str),
    #[error("failed to fetch signing keys: {0}")]
    Network(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
    #[serde(default)]
    alg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    iss: Option<String>,
    sub: String,
    exp: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Value,
}

struct CachedIdentity {
    identity: Arc<Identity>,
    expires_at: Instant,
}

/// JWKS fetch/decode + a `kid`-keyed key cache + a token-hash cache,
/// matching SPEC_FULL.md §4.2's implementation detail for C2.
pub struct TokenValidator {
    config: OidcConfig,
    client: reqwest::Client,
    keys: RwLock<HashMap<String, DecodingKey>>,
    keys_fetched_at: RwLock<Option<Instant>>,
    token_cache: RwLock<HashMap<String, CachedIdentity>>,
}

impl TokenValidator {
    pub fn new(config: OidcConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            keys: RwLock::new(HashMap::new()),
            keys_fetched_at: RwLock::new(None),
            token_cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn validate(&self, raw_token: &str) -> Result<Arc<Identity>, TokenError> {
        let token_hash = hash_token(raw_token);
        if let Some(identity) = self.cached(&token_hash).await {
            return Ok(identity);
        }

        let header = decode_header(raw_token).map_err(|_| TokenError::InvalidToken)?;
        let kid = header.kid.ok_or(TokenError::UnknownKey)?;

        let key = match self.key_for(&kid).await {
            Some(key) => key,
            None => {
                self.refresh_keys().await?;
                self.key_for(&kid).await.ok_or(TokenError::UnknownKey)?
            }
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&self.config.audiences);
        validation.set_issuer(&[self.config.issuer.as_str()]);
        let data = decode::<Claims>(raw_token, &key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::ExpiredToken,
                _ => TokenError::InvalidToken,
            }
        })?;

        let claims = data.claims;
        let groups = extract_groups(&claims.extra, &self.config.groups_claim)?;
        let token_expiry = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or(TokenError::InvalidToken)?;

        let identity = Arc::new(Identity {
            subject: claims.sub,
            display_name: claims.name,
            groups,
            token_expiry,
            raw_claims: claims.extra,
        });

        self.insert_cache(token_hash, identity.clone(), token_expiry)
            .await;
        Ok(identity)
    }

    async fn cached(&self, token_hash: &str) -> Option<Arc<Identity>> {
        let cache = self.token_cache.read().await;
        cache.get(token_hash).and_then(|entry| {
            (entry.expires_at > Instant::now()).then(|| entry.identity.clone())
        })
    }

    async fn insert_cache(
        &self,
        token_hash: String,
        identity: Arc<Identity>,
        token_expiry: chrono::DateTime<Utc>,
    ) {
        let seconds_until_expiry = (token_expiry - Utc::now()).num_seconds().max(0) as u64;
        let ttl = Duration::from_secs(seconds_until_expiry).min(self.config.token_cache_cap);
        let mut cache = self.token_cache.write().await;
        cache.retain(|_, v| v.expires_at > Instant::now());
        cache.insert(
            token_hash,
            CachedIdentity {
                identity,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn key_for(&self, kid: &str) -> Option<DecodingKey> {
        let due_for_refresh = {
            let fetched_at = self.keys_fetched_at.read().await;
            fetched_at
                .map(|t| t.elapsed() > self.config.jwks_refresh_interval)
                .unwrap_or(true)
        };
        if due_for_refresh {
            return None;
        }
        self.keys.read().await.get(kid).cloned()
    }

    async fn refresh_keys(&self) -> Result<(), TokenError> {
        let jwks: JwkSet = self
            .client
            .get(self.config.jwks_url.clone())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut decoded = HashMap::new();
        for jwk in jwks.keys {
            if let Some(alg) = &jwk.alg {
                if alg != "RS256" {
                    continue;
                }
            }
            match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => {
                    decoded.insert(jwk.kid, key);
                }
                Err(e) => warn!(error = %e, "skipping malformed JWKS key"),
            }
        }

        *self.keys.write().await = decoded;
        *self.keys_fetched_at.write().await = Some(Instant::now());
        Ok(())
    }
}

fn hash_token(raw_token: &str) -> String {
    let digest = Sha256::digest(raw_token.as_bytes());
    hex::encode(digest)
}

fn extract_groups(raw_claims: &serde_json::Value, groups_claim: &str) -> Result<Vec<String>, TokenError> {
    let value = raw_claims
        .get(groups_claim)
        .or_else(|| raw_claims.get("cognito:groups"))
        .ok_or(TokenError::ClaimMissing("groups"))?;
    let groups = value
        .as_array()
        .ok_or(TokenError::ClaimMissing("groups"))?
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    Ok(groups)
}

/// Minimal hex encoder so this module doesn't need its own `hex`
/// dependency purely for formatting a SHA-256 digest.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(bytes.as_ref().len() * 2);
        for byte in bytes.as_ref() {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}
