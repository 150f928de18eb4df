//! Discovery Index (C5): hybrid lexical (BM25 via `tantivy`) + dense
//! vector (flat cosine k-NN) retrieval over tools and skills from all
//! enabled servers/agents, combined with weighted score fusion.

use std::collections::HashMap;
use std::sync::RwLock;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, STORED, STRING, Schema, TEXT, Value as _};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tracing::warn;

use crate::embedding::{EmbeddingProvider, cosine_similarity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Tool,
    Skill,
}

/// A unit of retrieval: one tool belonging to a server, or one skill
/// belonging to an agent.
#[derive(Debug, Clone)]
pub struct DiscoveryDocument {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub name: String,
    pub text: String,
    pub server_path: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredTool {
    pub entity_id: String,
    pub name: String,
    pub server_path: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredServer {
    pub server_path: String,
    pub best_score: f64,
    pub tools: Vec<ScoredTool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub services: Vec<ScoredServer>,
    pub degraded: bool,
}

struct Fields {
    entity_id: Field,
    entity_type: Field,
    name: Field,
    text: Field,
    server_path: Field,
    enabled: Field,
}

fn build_schema() -> (Schema, Fields) {
    let mut builder = Schema::builder();
    let entity_id = builder.add_text_field("entity_id", STRING | STORED);
    let entity_type = builder.add_text_field("entity_type", STRING | STORED);
    let name = builder.add_text_field("name", STRING | STORED);
    let text = builder.add_text_field("text", TEXT | STORED);
    let server_path = builder.add_text_field("server_path", STRING | STORED);
    let enabled = builder.add_text_field("enabled", STRING | STORED);
    (
        builder.build(),
        Fields {
            entity_id,
            entity_type,
            name,
            text,
            server_path,
            enabled,
        },
    )
}

/// Weights for hybrid score fusion, default 0.4 lexical / 0.6 vector
/// per SPEC_FULL.md §4.5.
#[derive(Debug, Clone, Copy)]
pub struct HybridWeights {
    pub bm25: f64,
    pub knn: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self { bm25: 0.4, knn: 0.6 }
    }
}

pub struct DiscoveryIndex {
    index: Index,
    writer: RwLock<IndexWriter>,
    reader: IndexReader,
    fields: Fields,
    embeddings: RwLock<HashMap<String, Vec<f32>>>,
    embedder: Box<dyn EmbeddingProvider>,
    weights: HybridWeights,
    /// A plain in-memory fallback mirror used when the lexical index
    /// cannot be queried (SPEC_FULL.md §4.5 Failure mode): lexical-only
    /// substring scoring against this set, flagged `degraded=true`.
    fallback: RwLock<Vec<DiscoveryDocument>>,
}

impl DiscoveryIndex {
    pub fn new(embedder: Box<dyn EmbeddingProvider>, weights: HybridWeights) -> tantivy::Result<Self> {
        let (schema, fields) = build_schema();
        let index = Index::create_in_ram(schema);
        let writer = index.writer(15_000_000)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;
        Ok(Self {
            index,
            writer: RwLock::new(writer),
            reader,
            fields,
            embeddings: RwLock::new(HashMap::new()),
            embedder,
            weights,
            fallback: RwLock::new(Vec::new()),
        })
    }

    /// Replace every document belonging to `server_path` -- used for
    /// register/edit (full replace of this server's tool set) and for
    /// toggle (replace with the same set, different `enabled`).
    pub fn upsert_server(&self, server_path: &str, docs: Vec<DiscoveryDocument>) -> tantivy::Result<()> {
        self.remove_server(server_path)?;
        let mut writer = self.writer.write().expect("index writer lock poisoned");
        let mut embeddings = self.embeddings.write().expect("embeddings lock poisoned");
        let mut fallback = self.fallback.write().expect("fallback lock poisoned");
        for doc in &docs {
            writer.add_document(tantivy::doc!(
                self.fields.entity_id => doc.entity_id.clone(),
                self.fields.entity_type => entity_type_str(doc.entity_type),
                self.fields.name => doc.name.clone(),
                self.fields.text => doc.text.clone(),
                self.fields.server_path => doc.server_path.clone(),
                self.fields.enabled => doc.enabled.to_string(),
            ))?;
            let embedding = self.embedder.embed(&doc.text);
            embeddings.insert(doc.entity_id.clone(), embedding);
            fallback.push(doc.clone());
        }
        writer.commit()?;
        drop(writer);
        self.reader.reload()?;
        Ok(())
    }

    /// Remove a server's documents without deleting its embeddings
    /// eagerly (register/edit immediately calls `upsert_server` after,
    /// so embeddings are recomputed in the same pass).
    pub fn remove_server(&self, server_path: &str) -> tantivy::Result<()> {
        let mut writer = self.writer.write().expect("index writer lock poisoned");
        writer.delete_term(Term::from_field_text(self.fields.server_path, server_path));
        writer.commit()?;
        drop(writer);
        self.reader.reload()?;

        let mut embeddings = self.embeddings.write().expect("embeddings lock poisoned");
        embeddings.retain(|id, _| !id.starts_with(&format!("tool:{server_path}:")) && !id.starts_with(&format!("skill:{server_path}:")));
        let mut fallback = self.fallback.write().expect("fallback lock poisoned");
        fallback.retain(|d| d.server_path != server_path);
        Ok(())
    }

    /// Full rebuild from a fresh document set -- used at startup and
    /// on an explicit admin-triggered reindex.
    pub fn rebuild(&self, docs: Vec<DiscoveryDocument>) -> tantivy::Result<()> {
        let mut writer = self.writer.write().expect("index writer lock poisoned");
        writer.delete_all_documents()?;
        writer.commit()?;
        drop(writer);
        self.embeddings.write().expect("embeddings lock poisoned").clear();
        self.fallback.write().expect("fallback lock poisoned").clear();

        let by_server: HashMap<String, Vec<DiscoveryDocument>> = docs
            .into_iter()
            .into_group_map_by(|d| d.server_path.clone());
        for (server_path, docs) in by_server {
            self.upsert_server(&server_path, docs)?;
        }
        Ok(())
    }

    /// Hybrid query per SPEC_FULL.md §4.5. `visible` filters the
    /// result set by server path after scoring, modelling "visible to
    /// the caller per C4 filtering" without coupling this crate to the
    /// authorization engine's types.
    pub fn search(
        &self,
        query_text: &str,
        top_k_services: usize,
        top_n_tools: usize,
        visible: impl Fn(&str) -> bool,
    ) -> SearchResult {
        match self.search_hybrid(query_text, top_k_services, top_n_tools, &visible) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "discovery index query failed, falling back to lexical-only");
                self.search_fallback(query_text, top_k_services, top_n_tools, &visible)
            }
        }
    }

    fn search_hybrid(
        &self,
        query_text: &str,
        top_k_services: usize,
        top_n_tools: usize,
        visible: &impl Fn(&str) -> bool,
    ) -> tantivy::Result<SearchResult> {
        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.fields.text]);
        let query = parser
            .parse_query(&escape_query(query_text))
            .unwrap_or_else(|_| Box::new(tantivy::query::AllQuery));

        // Cast a wide lexical net so the vector rescorer has enough
        // candidates to fuse against.
        let candidate_cap = (top_k_services * top_n_tools * 20).max(200);
        let hits = searcher.search(&query, &TopDocs::with_limit(candidate_cap))?;

        let query_embedding = self.embedder.embed(query_text);
        let embeddings = self.embeddings.read().expect("embeddings lock poisoned");

        struct Candidate {
            entity_id: String,
            name: String,
            server_path: String,
            bm25: f64,
            knn: f64,
        }

        let mut candidates = Vec::with_capacity(hits.len());
        for (bm25_score, address) in hits {
            let doc: TantivyDocument = searcher.doc(address)?;
            let entity_id = doc
                .get_first(self.fields.entity_id)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let enabled = doc
                .get_first(self.fields.enabled)
                .and_then(|v| v.as_str())
                .unwrap_or("false")
                == "true";
            let server_path = doc
                .get_first(self.fields.server_path)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if !enabled || !visible(&server_path) {
                continue;
            }
            let name = doc
                .get_first(self.fields.name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let knn = embeddings
                .get(&entity_id)
                .map(|v| cosine_similarity(&query_embedding, v) as f64)
                .unwrap_or(0.0);

            candidates.push(Candidate {
                entity_id,
                name,
                server_path,
                bm25: bm25_score as f64,
                knn,
            });
        }

        let (bm25_min, bm25_max) = min_max(candidates.iter().map(|c| c.bm25));
        let (knn_min, knn_max) = min_max(candidates.iter().map(|c| c.knn));

        let mut scored: Vec<ScoredTool> = candidates
            .iter()
            .map(|c| {
                let norm_bm25 = normalize(c.bm25, bm25_min, bm25_max);
                let norm_knn = normalize(c.knn, knn_min, knn_max);
                let score = self.weights.bm25 * norm_bm25 + self.weights.knn * norm_knn;
                ScoredTool {
                    entity_id: c.entity_id.clone(),
                    name: c.name.clone(),
                    server_path: c.server_path.clone(),
                    score,
                }
            })
            .collect();

        // Tie-break: higher raw vector score wins, then lexicographic entity_id.
        let knn_by_id: HashMap<&str, f64> = candidates
            .iter()
            .map(|c| (c.entity_id.as_str(), c.knn))
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let knn_a = knn_by_id.get(a.entity_id.as_str()).copied().unwrap_or(0.0);
                    let knn_b = knn_by_id.get(b.entity_id.as_str()).copied().unwrap_or(0.0);
                    knn_b.partial_cmp(&knn_a).unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });

        let grouped = group_and_truncate(scored, top_k_services, top_n_tools);
        Ok(SearchResult {
            services: grouped,
            degraded: false,
        })
    }

    fn search_fallback(
        &self,
        query_text: &str,
        top_k_services: usize,
        top_n_tools: usize,
        visible: &impl Fn(&str) -> bool,
    ) -> SearchResult {
        let needle = query_text.to_lowercase();
        let fallback = self.fallback.read().expect("fallback lock poisoned");
        let mut scored: Vec<ScoredTool> = fallback
            .iter()
            .filter(|d| d.enabled && visible(&d.server_path))
            .filter_map(|d| {
                let haystack = d.text.to_lowercase();
                let score = needle
                    .split_whitespace()
                    .filter(|term| haystack.contains(term))
                    .count() as f64;
                (score > 0.0).then_some(ScoredTool {
                    entity_id: d.entity_id.clone(),
                    name: d.name.clone(),
                    server_path: d.server_path.clone(),
                    score,
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });

        SearchResult {
            services: group_and_truncate(scored, top_k_services, top_n_tools),
            degraded: true,
        }
    }
}

fn entity_type_str(t: EntityType) -> &'static str {
    match t {
        EntityType::Tool => "tool",
        EntityType::Skill => "skill",
    }
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), v| {
        (min.min(v), max.max(v))
    })
}

fn normalize(value: f64, min: f64, max: f64) -> f64 {
    if !min.is_finite() || !max.is_finite() || (max - min).abs() < f64::EPSILON {
        0.0
    } else {
        (value - min) / (max - min)
    }
}

/// Group scored tools by server, keep the top `top_k_services` groups
/// ranked by each group's best tool score, and within each group keep
/// up to `top_n_tools` tools.
fn group_and_truncate(
    scored: Vec<ScoredTool>,
    top_k_services: usize,
    top_n_tools: usize,
) -> Vec<ScoredServer> {
    let mut by_server: HashMap<String, Vec<ScoredTool>> = HashMap::new();
    for tool in scored {
        by_server.entry(tool.server_path.clone()).or_default().push(tool);
    }

    let mut servers: Vec<ScoredServer> = by_server
        .into_iter()
        .map(|(server_path, mut tools)| {
            tools.truncate(top_n_tools);
            let best_score = tools.first().map(|t| t.score).unwrap_or(0.0);
            ScoredServer {
                server_path,
                best_score,
                tools,
            }
        })
        .collect();

    servers.sort_by(|a, b| {
        b.best_score
            .partial_cmp(&a.best_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.server_path.cmp(&b.server_path))
    });
    servers.truncate(top_k_services);
    servers
}

/// `QueryParser` treats several characters as special syntax; user
/// search strings are free text, so escape them defensively rather
/// than surface a parse error for an ordinary query containing e.g. `:`.
fn escape_query(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '+' | '-' | '&' | '|' | '!' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '"' | '~'
            | '*' | '?' | ':' | '\\' | '/' => format!("\\{c}"),
            other => other.to_string(),
        })
        .collect()
}
