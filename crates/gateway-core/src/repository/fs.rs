//! Filesystem repository backend: one JSON file per record under a
//! well-known directory, atomic writes (write-temp-then-rename), a
//! per-path writer lock, and a process-local read cache invalidated on
//! every successful write.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AgentRepository, Precondition, RatingOutcome, ServerRepository};
use crate::error::RepositoryError;
use crate::model::{AgentRecord, HealthStatus, Keyed, RecordKind, ServerRecord};

/// A generic JSON-file-per-record store, parameterized over the
/// record type. `ServerRepository`/`AgentRepository` are thin trait
/// impls over this shared engine.
pub struct FileRepository<T> {
    dir: PathBuf,
    state_file: PathBuf,
    kind: RecordKind,
    cache: RwLock<HashMap<String, T>>,
    generations: RwLock<HashMap<String, u64>>,
    path_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<T> FileRepository<T>
where
    T: Keyed + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Scan `dir` (created if missing) into the in-memory cache. The
    /// directory is namespaced by the caller (e.g. `data/<namespace>/servers`).
    pub async fn open(dir: impl Into<PathBuf>, kind: RecordKind) -> Result<Self, RepositoryError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let state_file = dir.join(match kind {
            RecordKind::Server => "server_state.json",
            RecordKind::Agent => "agent_state.json",
        });

        let mut cache = HashMap::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if path == state_file {
                continue;
            }
            let contents = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<T>(&contents) {
                Ok(record) => {
                    cache.insert(record.path().as_str().to_string(), record);
                }
                Err(e) => warn!(file = %path.display(), error = %e, "skipping unreadable record file"),
            }
        }

        debug!(dir = %dir.display(), records = cache.len(), "repository scanned");

        Ok(Self {
            dir,
            state_file,
            kind,
            cache: RwLock::new(cache),
            generations: RwLock::new(HashMap::new()),
            path_locks: Mutex::new(HashMap::new()),
        })
    }

    async fn lock_for(&self, path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.path_locks.lock().await;
        locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn file_path(&self, path: &str) -> PathBuf {
        // Record paths may contain `/`; flatten to a filesystem-safe name.
        let flat = path.replace('/', "__");
        self.dir.join(format!("{flat}.json"))
    }

    async fn write_state_file(&self) -> Result<(), RepositoryError> {
        let cache = self.cache.read().await;
        let state: HashMap<&str, bool> = cache
            .iter()
            .map(|(k, v)| (k.as_str(), v.enabled()))
            .collect();
        let contents = serde_json::to_vec_pretty(&state)?;
        atomic_write(&self.state_file, &contents).await
    }

    async fn persist(&self, record: &T) -> Result<(), RepositoryError> {
        let file = self.file_path(record.path().as_str());
        let contents = serde_json::to_vec_pretty(record)?;
        atomic_write(&file, &contents).await?;
        self.write_state_file().await
    }

    pub async fn get_generic(&self, path: &str) -> Result<Option<T>, RepositoryError> {
        Ok(self.cache.read().await.get(path).cloned())
    }

    pub async fn list_generic(&self) -> Result<Vec<T>, RepositoryError> {
        Ok(self.cache.read().await.values().cloned().collect())
    }

    pub async fn put_generic(
        &self,
        record: T,
        precondition: Precondition,
    ) -> Result<(), RepositoryError> {
        let path = record.path().as_str().to_string();
        let lock = self.lock_for(&path).await;
        let _guard = lock.lock().await;

        if let Precondition::Version(expected) = precondition {
            let generations = self.generations.read().await;
            let actual = generations.get(&path).copied().unwrap_or(0);
            if actual != expected {
                return Err(RepositoryError::VersionConflict { path });
            }
        }

        self.persist(&record).await?;
        self.cache.write().await.insert(path.clone(), record);
        let mut generations = self.generations.write().await;
        *generations.entry(path).or_insert(0) += 1;
        Ok(())
    }

    pub async fn delete_generic(&self, path: &str) -> Result<(), RepositoryError> {
        let lock = self.lock_for(path).await;
        let _guard = lock.lock().await;

        let existed = self.cache.write().await.remove(path).is_some();
        if !existed {
            return Err(RepositoryError::NotFound {
                kind: self.kind,
                path: path.to_string(),
            });
        }
        let file = self.file_path(path);
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.write_state_file().await
    }

    pub async fn toggle_generic(&self, path: &str, enabled: bool) -> Result<T, RepositoryError> {
        let lock = self.lock_for(path).await;
        let _guard = lock.lock().await;

        let mut record = {
            let cache = self.cache.read().await;
            cache
                .get(path)
                .cloned()
                .ok_or_else(|| RepositoryError::NotFound {
                    kind: self.kind,
                    path: path.to_string(),
                })?
        };
        record.set_enabled(enabled);
        self.persist(&record).await?;
        self.cache
            .write()
            .await
            .insert(path.to_string(), record.clone());
        Ok(record)
    }

    /// Load, mutate in place via `f`, persist and re-cache. `f` reports
    /// its own domain errors (e.g. an out-of-range rating) through `E`,
    /// which must also be constructible from a plain `RepositoryError`
    /// so lookup/IO failures convert for free via `?`.
    pub async fn update_generic<F, E>(&self, path: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut T) -> Result<(), E>,
        E: From<RepositoryError>,
    {
        let lock = self.lock_for(path).await;
        let _guard = lock.lock().await;

        let mut record = {
            let cache = self.cache.read().await;
            cache
                .get(path)
                .cloned()
                .ok_or_else(|| RepositoryError::NotFound {
                    kind: self.kind,
                    path: path.to_string(),
                })?
        };
        f(&mut record)?;
        self.persist(&record).await?;
        self.cache
            .write()
            .await
            .insert(path.to_string(), record.clone());
        Ok(record)
    }
}

/// Write `contents` to `path` by first writing a temporary sibling
/// file then renaming it into place -- the rename is atomic on the
/// same filesystem, so readers never observe a partially-written file.
async fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), RepositoryError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_name = format!(".{}.tmp-{}", file_name(path), Uuid::new_v4());
    let tmp_path = parent.join(tmp_name);
    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "record".to_string())
}

pub struct FsServerRepository {
    inner: FileRepository<ServerRecord>,
}

impl FsServerRepository {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        Ok(Self {
            inner: FileRepository::open(dir, RecordKind::Server).await?,
        })
    }
}

#[async_trait]
impl ServerRepository for FsServerRepository {
    async fn get(&self, path: &str) -> Result<Option<ServerRecord>, RepositoryError> {
        self.inner.get_generic(path).await
    }

    async fn list(&self) -> Result<Vec<ServerRecord>, RepositoryError> {
        self.inner.list_generic().await
    }

    async fn put(
        &self,
        record: ServerRecord,
        precondition: Precondition,
    ) -> Result<(), RepositoryError> {
        self.inner.put_generic(record, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<(), RepositoryError> {
        self.inner.delete_generic(path).await
    }

    async fn toggle(&self, path: &str, enabled: bool) -> Result<ServerRecord, RepositoryError> {
        self.inner.toggle_generic(path, enabled).await
    }

    async fn update_health(
        &self,
        path: &str,
        status: HealthStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<ServerRecord, RepositoryError> {
        self.inner
            .update_generic(path, |record| {
                record.set_health(status, checked_at);
                Ok(())
            })
            .await
    }

    async fn rate(&self, path: &str, rating: u8) -> Result<ServerRecord, RatingOutcome> {
        self.inner
            .update_generic(path, |record| record.apply_rating(rating).map_err(Into::into))
            .await
    }
}

pub struct FsAgentRepository {
    inner: FileRepository<AgentRecord>,
}

impl FsAgentRepository {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        Ok(Self {
            inner: FileRepository::open(dir, RecordKind::Agent).await?,
        })
    }
}

#[async_trait]
impl AgentRepository for FsAgentRepository {
    async fn get(&self, path: &str) -> Result<Option<AgentRecord>, RepositoryError> {
        self.inner.get_generic(path).await
    }

    async fn list(&self) -> Result<Vec<AgentRecord>, RepositoryError> {
        self.inner.list_generic().await
    }

    async fn put(
        &self,
        record: AgentRecord,
        precondition: Precondition,
    ) -> Result<(), RepositoryError> {
        self.inner.put_generic(record, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<(), RepositoryError> {
        self.inner.delete_generic(path).await
    }

    async fn toggle(&self, path: &str, enabled: bool) -> Result<AgentRecord, RepositoryError> {
        self.inner.toggle_generic(path, enabled).await
    }

    async fn rate(&self, path: &str, rating: u8) -> Result<AgentRecord, RatingOutcome> {
        self.inner
            .update_generic(path, |record| record.apply_rating(rating).map_err(Into::into))
            .await
    }
}
