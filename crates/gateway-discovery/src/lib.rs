//! Hybrid tool/skill discovery index (C5): BM25 lexical search fused
//! with dense-vector cosine similarity over all enabled servers' tools
//! and agents' skills.

pub mod embedding;
pub mod index;

pub use embedding::{EmbeddingProvider, HashEmbeddingProvider, cosine_similarity};
pub use index::{DiscoveryDocument, DiscoveryIndex, EntityType, HybridWeights, ScoredServer, ScoredTool, SearchResult};

use gateway_core::model::{AgentRecord, ServerRecord};

/// Build the discovery documents for a server's tool list, per
/// SPEC_FULL.md §4.5's `text` definition: name + description + tags +
/// schema field names concatenated into one searchable string.
pub fn server_documents(server: &ServerRecord) -> Vec<DiscoveryDocument> {
    server
        .tool_list
        .iter()
        .map(|tool| {
            let schema_fields = tool
                .schema
                .as_object()
                .map(|obj| {
                    obj.get("properties")
                        .and_then(|p| p.as_object())
                        .map(|props| props.keys().cloned().collect::<Vec<_>>().join(" "))
                        .unwrap_or_default()
                })
                .unwrap_or_default();
            let text = [
                tool.name.as_str(),
                tool.parsed_description.main.as_str(),
                &tool.parsed_description.args.join(" "),
                &schema_fields,
                &server.tags.iter().cloned().collect::<Vec<_>>().join(" "),
            ]
            .join(" ");
            DiscoveryDocument {
                entity_id: format!("tool:{}:{}", server.path.as_str(), tool.name),
                entity_type: EntityType::Tool,
                name: tool.name.clone(),
                text,
                server_path: server.path.as_str().to_string(),
                enabled: server.enabled,
            }
        })
        .collect()
}

/// Build the discovery documents for an agent's skill list.
pub fn agent_documents(agent: &AgentRecord) -> Vec<DiscoveryDocument> {
    agent
        .skills
        .iter()
        .map(|skill| {
            let text = [
                skill.name.as_str(),
                skill.description.as_str(),
                &skill.tags.iter().cloned().collect::<Vec<_>>().join(" "),
            ]
            .join(" ");
            DiscoveryDocument {
                entity_id: format!("skill:{}:{}", agent.path.as_str(), skill.name),
                entity_type: EntityType::Skill,
                name: skill.name.clone(),
                text,
                server_path: agent.path.as_str().to_string(),
                enabled: agent.enabled,
            }
        })
        .collect()
}
