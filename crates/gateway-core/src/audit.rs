//! Audit Log (C9): an append-only record of authorization decisions,
//! registrations and toggles. Every mutation produces exactly one
//! entry, written synchronously before the mutation's HTTP response is
//! returned (SPEC_FULL.md §4.9, invariant 5).

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

use crate::model::{AuditAction, AuditEntry, Decision};

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("failed to append audit entry: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize audit entry: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError>;
}

/// Convenience constructor used by callers that just need to describe
/// what happened without building an `AuditEntry` by hand.
pub fn entry(
    subject: impl Into<String>,
    action: AuditAction,
    target: impl Into<String>,
    decision: Decision,
    request_id: Option<String>,
) -> AuditEntry {
    AuditEntry {
        timestamp: Utc::now(),
        subject: subject.into(),
        action,
        target: target.into(),
        decision,
        delta: None,
        request_id,
    }
}

/// Append-only JSON-lines file sink. A single write-lock per sink
/// instance preserves the ordering guarantee from SPEC_FULL.md §5:
/// entries for the same `(subject, target)` pair appear in commit
/// order.
pub struct FileAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileAuditSink {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let line = serde_json::to_string(&entry)?;
        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-memory sink used by tests and by the no-op audit configuration.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}

/// Record an entry, logging (but not propagating) a failure to write
/// it -- callers still return the mutation's real response even if the
/// audit append itself fails, since the mutation already committed.
pub async fn record_best_effort(sink: &Arc<dyn AuditSink>, entry: AuditEntry) {
    if let Err(e) = sink.record(entry).await {
        error!(error = %e, "failed to append audit entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DenyReason;
    use tempfile::TempDir;

    #[tokio::test]
    async fn appends_entries_in_order() {
        let dir = TempDir::new().unwrap();
        let sink = FileAuditSink::open(dir.path().join("audit.jsonl"))
            .await
            .unwrap();

        sink.record(entry(
            "user-1",
            AuditAction::McpCall,
            "/currenttime",
            Decision::Allow,
            None,
        ))
        .await
        .unwrap();
        sink.record(entry(
            "user-1",
            AuditAction::McpCall,
            "/currenttime",
            Decision::Deny {
                reason: DenyReason::NoMatchingRule,
            },
            None,
        ))
        .await
        .unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("audit.jsonl"))
            .await
            .unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"allow\""));
        assert!(lines[1].contains("no_matching_rule"));
    }

    #[tokio::test]
    async fn memory_sink_collects_entries() {
        let sink = MemoryAuditSink::new();
        sink.record(entry(
            "user-2",
            AuditAction::ToggleServer,
            "/weather",
            Decision::Allow,
            Some("req-1".to_string()),
        ))
        .await
        .unwrap();
        let entries = sink.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].subject, "user-2");
    }
}
