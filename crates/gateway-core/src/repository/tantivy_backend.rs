//! Search-index-backed repository. The distilled spec describes this
//! backend as records stored as documents in a search cluster, one
//! index per kind, with immediate-refresh for read-after-write and a
//! `path`-keyword lookup. No external search-cluster client is part of
//! the corpus's dependency stack, so this crate resolves that Open
//! Question (see DESIGN.md) by hosting the index embedded via
//! `tantivy` -- already the hybrid-index engine this codebase uses for
//! C5 discovery -- rather than fabricating a network client.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tantivy::collector::TopDocs;
use tantivy::query::{AllQuery, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, STORED, STRING, Schema, TEXT};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, Term};
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use super::{AgentRepository, Precondition, RatingOutcome, ServerRepository};
use crate::error::RepositoryError;
use crate::model::{AgentRecord, HealthStatus, Keyed, RecordKind, ServerRecord};

const LIST_CAP: usize = 50_000;

struct IndexFields {
    path: Field,
    body: Field,
    enabled: Field,
}

fn build_schema() -> (Schema, IndexFields) {
    let mut builder = Schema::builder();
    let path = builder.add_text_field("path", STRING | STORED);
    let body = builder.add_text_field("body", STORED);
    let enabled = builder.add_text_field("enabled", STRING | STORED);
    // A lightly-tokenized namespace field keeps the door open for
    // multi-tenant filtering without changing the on-disk schema.
    let _namespace = builder.add_text_field("namespace", TEXT | STORED);
    (builder.build(), IndexFields { path, body, enabled })
}

pub struct TantivyRepository<T> {
    kind: RecordKind,
    index: Index,
    writer: AsyncMutex<IndexWriter>,
    reader: IndexReader,
    fields: IndexFields,
    cache: RwLock<HashMap<String, (T, Instant)>>,
    cache_ttl: Duration,
    _record: std::marker::PhantomData<T>,
}

impl<T> TantivyRepository<T>
where
    T: Keyed + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn open_in_dir(dir: &Path, kind: RecordKind, cache_ttl: Duration) -> Result<Self, RepositoryError> {
        std::fs::create_dir_all(dir)?;
        let (schema, fields) = build_schema();
        let index = match Index::open_in_dir(dir) {
            Ok(index) => index,
            Err(_) => Index::create_in_dir(dir, schema)
                .map_err(|e| RepositoryError::Index(e.to_string()))?,
        };
        let writer = index
            .writer(15_000_000)
            .map_err(|e| RepositoryError::Index(e.to_string()))?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .map_err(|e: tantivy::TantivyError| RepositoryError::Index(e.to_string()))?;

        Ok(Self {
            kind,
            index,
            writer: AsyncMutex::new(writer),
            reader,
            fields,
            cache: RwLock::new(HashMap::new()),
            cache_ttl,
            _record: std::marker::PhantomData,
        })
    }

    pub fn open_in_ram(kind: RecordKind, cache_ttl: Duration) -> Result<Self, RepositoryError> {
        let (schema, fields) = build_schema();
        let index = Index::create_in_ram(schema);
        let writer = index
            .writer(15_000_000)
            .map_err(|e| RepositoryError::Index(e.to_string()))?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .map_err(|e: tantivy::TantivyError| RepositoryError::Index(e.to_string()))?;
        Ok(Self {
            kind,
            index,
            writer: AsyncMutex::new(writer),
            reader,
            fields,
            cache: RwLock::new(HashMap::new()),
            cache_ttl,
            _record: std::marker::PhantomData,
        })
    }

    fn deserialize_doc(&self, doc: &tantivy::TantivyDocument) -> Option<T> {
        use tantivy::schema::Value as _;
        let body = doc
            .get_first(self.fields.body)
            .and_then(|v| v.as_str())?;
        serde_json::from_str(body).ok()
    }

    async fn cache_get(&self, path: &str) -> Option<T> {
        let cache = self.cache.read().await;
        cache.get(path).and_then(|(record, inserted)| {
            if inserted.elapsed() < self.cache_ttl {
                Some(record.clone())
            } else {
                None
            }
        })
    }

    async fn cache_put(&self, path: &str, record: T) {
        self.cache
            .write()
            .await
            .insert(path.to_string(), (record, Instant::now()));
    }

    async fn cache_evict(&self, path: &str) {
        self.cache.write().await.remove(path);
    }

    pub async fn get_generic(&self, path: &str) -> Result<Option<T>, RepositoryError> {
        if let Some(record) = self.cache_get(path).await {
            return Ok(Some(record));
        }

        let searcher = self.reader.searcher();
        let term = Term::from_field_text(self.fields.path, path);
        let query = TermQuery::new(term, IndexRecordOption::Basic);
        let hits = searcher
            .search(&query, &TopDocs::with_limit(1))
            .map_err(|e| RepositoryError::Index(e.to_string()))?;
        let Some((_, address)) = hits.into_iter().next() else {
            return Ok(None);
        };
        let doc: tantivy::TantivyDocument = searcher
            .doc(address)
            .map_err(|e| RepositoryError::Index(e.to_string()))?;
        let record = self.deserialize_doc(&doc);
        if let Some(record) = &record {
            self.cache_put(path, record.clone()).await;
        }
        Ok(record)
    }

    pub async fn list_generic(&self) -> Result<Vec<T>, RepositoryError> {
        let searcher = self.reader.searcher();
        let hits = searcher
            .search(&AllQuery, &TopDocs::with_limit(LIST_CAP))
            .map_err(|e| RepositoryError::Index(e.to_string()))?;
        let mut out = Vec::with_capacity(hits.len());
        for (_, address) in hits {
            let doc: tantivy::TantivyDocument = searcher
                .doc(address)
                .map_err(|e| RepositoryError::Index(e.to_string()))?;
            if let Some(record) = self.deserialize_doc(&doc) {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub async fn put_generic(
        &self,
        record: T,
        _precondition: Precondition,
    ) -> Result<(), RepositoryError> {
        // The search-index backend does not offer a native
        // compare-and-swap primitive; both backends are documented as
        // last-writer-wins with the filesystem backend alone enforcing
        // a hard version precondition (see DESIGN.md Open Question #3).
        let path = record.path().as_str().to_string();
        let body = serde_json::to_string(&record)?;

        let mut writer = self.writer.lock().await;
        writer.delete_term(Term::from_field_text(self.fields.path, &path));
        writer
            .add_document(tantivy::doc!(
                self.fields.path => path.clone(),
                self.fields.body => body,
                self.fields.enabled => record.enabled().to_string(),
            ))
            .map_err(|e| RepositoryError::Index(e.to_string()))?;
        writer
            .commit()
            .map_err(|e| RepositoryError::Index(e.to_string()))?;
        drop(writer);

        self.reader
            .reload()
            .map_err(|e| RepositoryError::Index(e.to_string()))?;
        self.cache_put(&path, record).await;
        Ok(())
    }

    pub async fn delete_generic(&self, path: &str) -> Result<(), RepositoryError> {
        if self.get_generic(path).await?.is_none() {
            return Err(RepositoryError::NotFound {
                kind: self.kind,
                path: path.to_string(),
            });
        }
        let mut writer = self.writer.lock().await;
        writer.delete_term(Term::from_field_text(self.fields.path, path));
        writer
            .commit()
            .map_err(|e| RepositoryError::Index(e.to_string()))?;
        drop(writer);
        self.reader
            .reload()
            .map_err(|e| RepositoryError::Index(e.to_string()))?;
        self.cache_evict(path).await;
        Ok(())
    }

    pub async fn toggle_generic(&self, path: &str, enabled: bool) -> Result<T, RepositoryError> {
        let mut record = self
            .get_generic(path)
            .await?
            .ok_or_else(|| RepositoryError::NotFound {
                kind: self.kind,
                path: path.to_string(),
            })?;
        record.set_enabled(enabled);
        self.put_generic(record.clone(), Precondition::Any).await?;
        Ok(record)
    }

    /// Delete-and-re-add `f`'s mutation, mirroring `toggle_generic`: the
    /// index has no in-place update, so every mutation is a full
    /// re-index of the record.
    pub async fn update_generic<F, E>(&self, path: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut T) -> Result<(), E>,
        E: From<RepositoryError>,
    {
        let mut record = self
            .get_generic(path)
            .await?
            .ok_or_else(|| RepositoryError::NotFound {
                kind: self.kind,
                path: path.to_string(),
            })?;
        f(&mut record)?;
        self.put_generic(record.clone(), Precondition::Any).await?;
        Ok(record)
    }
}

pub struct TantivyServerRepository(TantivyRepository<ServerRecord>);

impl TantivyServerRepository {
    pub fn open_in_dir(dir: &Path, cache_ttl: Duration) -> Result<Self, RepositoryError> {
        Ok(Self(TantivyRepository::open_in_dir(
            dir,
            RecordKind::Server,
            cache_ttl,
        )?))
    }

    pub fn open_in_ram(cache_ttl: Duration) -> Result<Self, RepositoryError> {
        Ok(Self(TantivyRepository::open_in_ram(
            RecordKind::Server,
            cache_ttl,
        )?))
    }
}

#[async_trait]
impl ServerRepository for TantivyServerRepository {
    async fn get(&self, path: &str) -> Result<Option<ServerRecord>, RepositoryError> {
        self.0.get_generic(path).await
    }

    async fn list(&self) -> Result<Vec<ServerRecord>, RepositoryError> {
        self.0.list_generic().await
    }

    async fn put(
        &self,
        record: ServerRecord,
        precondition: Precondition,
    ) -> Result<(), RepositoryError> {
        self.0.put_generic(record, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<(), RepositoryError> {
        self.0.delete_generic(path).await
    }

    async fn toggle(&self, path: &str, enabled: bool) -> Result<ServerRecord, RepositoryError> {
        self.0.toggle_generic(path, enabled).await
    }

    async fn update_health(
        &self,
        path: &str,
        status: HealthStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<ServerRecord, RepositoryError> {
        self.0
            .update_generic(path, |record| {
                record.set_health(status, checked_at);
                Ok(())
            })
            .await
    }

    async fn rate(&self, path: &str, rating: u8) -> Result<ServerRecord, RatingOutcome> {
        self.0
            .update_generic(path, |record| record.apply_rating(rating).map_err(Into::into))
            .await
    }
}

pub struct TantivyAgentRepository(TantivyRepository<AgentRecord>);

impl TantivyAgentRepository {
    pub fn open_in_dir(dir: &Path, cache_ttl: Duration) -> Result<Self, RepositoryError> {
        Ok(Self(TantivyRepository::open_in_dir(
            dir,
            RecordKind::Agent,
            cache_ttl,
        )?))
    }

    pub fn open_in_ram(cache_ttl: Duration) -> Result<Self, RepositoryError> {
        Ok(Self(TantivyRepository::open_in_ram(
            RecordKind::Agent,
            cache_ttl,
        )?))
    }
}

#[async_trait]
impl AgentRepository for TantivyAgentRepository {
    async fn get(&self, path: &str) -> Result<Option<AgentRecord>, RepositoryError> {
        self.0.get_generic(path).await
    }

    async fn list(&self) -> Result<Vec<AgentRecord>, RepositoryError> {
        self.0.list_generic().await
    }

    async fn put(
        &self,
        record: AgentRecord,
        precondition: Precondition,
    ) -> Result<(), RepositoryError> {
        self.0.put_generic(record, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<(), RepositoryError> {
        self.0.delete_generic(path).await
    }

    async fn toggle(&self, path: &str, enabled: bool) -> Result<AgentRecord, RepositoryError> {
        self.0.toggle_generic(path, enabled).await
    }

    async fn rate(&self, path: &str, rating: u8) -> Result<AgentRecord, RatingOutcome> {
        self.0
            .update_generic(path, |record| record.apply_rating(rating).map_err(Into::into))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HealthStatus, RecordPath, Transport};
    use std::collections::BTreeSet;

    fn sample_server(path: &str) -> ServerRecord {
        ServerRecord {
            path: RecordPath::new(path).unwrap(),
            server_name: "Weather".to_string(),
            description: "forecast tools".to_string(),
            proxy_pass_url: url::Url::parse("http://weather:8000/").unwrap(),
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

    #[tokio::test]
    async fn put_then_get_is_read_after_write_consistent() {
        let repo = TantivyServerRepository::open_in_ram(Duration::from_secs(60)).unwrap();
        repo.put(sample_server("/weather"), Precondition::Any)
            .await
            .unwrap();
        let fetched = repo.get("/weather").await.unwrap().unwrap();
        assert_eq!(fetched.server_name, "Weather");
    }

    #[tokio::test]
    async fn delete_then_get_returns_none() {
        let repo = TantivyServerRepository::open_in_ram(Duration::from_secs(60)).unwrap();
        repo.put(sample_server("/weather"), Precondition::Any)
            .await
            .unwrap();
        repo.delete("/weather").await.unwrap();
        assert!(repo.get("/weather").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn toggle_updates_enabled_flag() {
        let repo = TantivyServerRepository::open_in_ram(Duration::from_secs(60)).unwrap();
        repo.put(sample_server("/weather"), Precondition::Any)
            .await
            .unwrap();
        let toggled = repo.toggle("/weather", false).await.unwrap();
        assert!(!toggled.enabled);
    }

    #[tokio::test]
    async fn update_health_persists_status() {
        let repo = TantivyServerRepository::open_in_ram(Duration::from_secs(60)).unwrap();
        repo.put(sample_server("/weather"), Precondition::Any)
            .await
            .unwrap();
        let checked_at = chrono::Utc::now();
        let updated = repo
            .update_health("/weather", HealthStatus::Unhealthy, checked_at)
            .await
            .unwrap();
        assert_eq!(updated.health_status, HealthStatus::Unhealthy);
        let fetched = repo.get("/weather").await.unwrap().unwrap();
        assert_eq!(fetched.health_status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn rate_folds_into_aggregate() {
        let repo = TantivyServerRepository::open_in_ram(Duration::from_secs(60)).unwrap();
        repo.put(sample_server("/weather"), Precondition::Any)
            .await
            .unwrap();
        repo.rate("/weather", 2).await.unwrap();
        let updated = repo.rate("/weather", 4).await.unwrap();
        assert_eq!(updated.num_stars.count, 2);
        assert!(repo.rate("/weather", 9).await.is_err());
    }
}
