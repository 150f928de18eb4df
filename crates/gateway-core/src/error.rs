use thiserror::Error;

use crate::model::RecordKind;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{kind:?} record `{path}` not found")]
    NotFound { kind: RecordKind, path: String },
    #[error("{kind:?} record `{path}` already exists")]
    Conflict { kind: RecordKind, path: String },
    #[error("version precondition failed for `{path}`")]
    VersionConflict { path: String },
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("index error: {0}")]
    Index(String),
}
