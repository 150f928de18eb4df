//! Repository Layer (C3): pluggable CRUD for servers and agents behind
//! a shared trait, so the rest of the system depends only on the
//! interface and never on a specific backend.

pub mod fs;
pub mod tantivy_backend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RepositoryError;
use crate::model::{AgentRecord, HealthStatus, RatingError, ServerRecord};

/// Optimistic-concurrency precondition for `put`. `Any` is
/// last-writer-wins; `Version(n)` fails with `VersionConflict` unless
/// the stored record is currently at generation `n`.
#[derive(Debug, Clone, Copy, Default)]
pub enum Precondition {
    #[default]
    Any,
    Version(u64),
}

#[async_trait]
pub trait ServerRepository: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<ServerRecord>, RepositoryError>;
    async fn list(&self) -> Result<Vec<ServerRecord>, RepositoryError>;
    async fn put(
        &self,
        record: ServerRecord,
        precondition: Precondition,
    ) -> Result<(), RepositoryError>;
    async fn delete(&self, path: &str) -> Result<(), RepositoryError>;
    async fn toggle(&self, path: &str, enabled: bool) -> Result<ServerRecord, RepositoryError>;
    /// Write the mutable health fields through to storage (C6 writes
    /// through C3 rather than mutating a shared object in place).
    async fn update_health(
        &self,
        path: &str,
        status: HealthStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<ServerRecord, RepositoryError>;
    /// Fold a new 1..=5 rating into the stored aggregate (SPEC_FULL.md
    /// Open Question #2: average, rounded to one decimal, recomputed
    /// per rating).
    async fn rate(&self, path: &str, rating: u8) -> Result<ServerRecord, RatingOutcome>;
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<AgentRecord>, RepositoryError>;
    async fn list(&self) -> Result<Vec<AgentRecord>, RepositoryError>;
    async fn put(
        &self,
        record: AgentRecord,
        precondition: Precondition,
    ) -> Result<(), RepositoryError>;
    async fn delete(&self, path: &str) -> Result<(), RepositoryError>;
    async fn toggle(&self, path: &str, enabled: bool) -> Result<AgentRecord, RepositoryError>;
    async fn rate(&self, path: &str, rating: u8) -> Result<AgentRecord, RatingOutcome>;
}

/// `rate` can fail either because the rating itself is out of range or
/// because the underlying store operation failed; callers need to tell
/// the two apart to pick the right HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum RatingOutcome {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    InvalidRating(#[from] RatingError),
}
