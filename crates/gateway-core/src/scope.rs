//! Scope policy document: parsing, validation and hot-reloadable
//! snapshot (C1, Config & Scope Loader).
//!
//! The policy is loaded once at startup and thereafter swapped
//! atomically -- readers (the authorization engine) always observe a
//! fully-formed snapshot, never a partially-applied reload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const WILDCARD: &str = "*";
const WILDCARD_ALL: &str = "all";

/// A server or tool match target: either an exact name or the `*`
/// wildcard. `all` is accepted as a synonym in `ui_scopes`/`agent_scopes`
/// collections, per the distilled spec's "`*` / `all`" note.
fn is_wildcard(value: &str) -> bool {
    value == WILDCARD || value == WILDCARD_ALL
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct UiScope {
    #[serde(default)]
    pub visible_servers: Vec<String>,
    #[serde(default)]
    pub visible_agents: Vec<String>,
}

impl UiScope {
    pub fn allows_server(&self, path: &str) -> bool {
        self.visible_servers.iter().any(|s| is_wildcard(s) || s == path)
    }

    pub fn allows_agent(&self, path: &str) -> bool {
        self.visible_agents.iter().any(|s| is_wildcard(s) || s == path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct McpServerRule {
    pub server: String,
    #[serde(default = "default_wildcard_list")]
    pub methods: Vec<String>,
    #[serde(default = "default_wildcard_list")]
    pub tools: Vec<String>,
}

fn default_wildcard_list() -> Vec<String> {
    vec![WILDCARD.to_string()]
}

impl McpServerRule {
    pub fn matches(&self, server_path: &str, method: &str, tool_name: Option<&str>) -> bool {
        let server_ok = is_wildcard(&self.server) || self.server == server_path;
        if !server_ok {
            return false;
        }
        let method_ok = self.methods.iter().any(|m| is_wildcard(m) || m == method);
        if !method_ok {
            return false;
        }
        if method == "tools/call" {
            match tool_name {
                Some(tool) => self.tools.iter().any(|t| is_wildcard(t) || t == tool),
                None => false,
            }
        } else {
            true
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct AgentScope {
    #[serde(default)]
    pub list_agents: Vec<String>,
    #[serde(default)]
    pub get_agent: Vec<String>,
    #[serde(default)]
    pub publish_agent: Vec<String>,
    #[serde(default)]
    pub modify_agent: Vec<String>,
    #[serde(default)]
    pub delete_agent: Vec<String>,
}

impl AgentScope {
    fn action_list(&self, action: &str) -> &[String] {
        match action {
            "list_agents" => &self.list_agents,
            "get_agent" => &self.get_agent,
            "publish_agent" => &self.publish_agent,
            "modify_agent" => &self.modify_agent,
            "delete_agent" => &self.delete_agent,
            _ => &[],
        }
    }

    pub fn allows(&self, action: &str, target: &str) -> bool {
        self.action_list(action)
            .iter()
            .any(|p| is_wildcard(p) || p == target)
    }
}

pub const ADMIN_SCOPE: &str = "registry-admins";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct ScopePolicy {
    pub group_mappings: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub ui_scopes: HashMap<String, UiScope>,
    #[serde(default)]
    pub mcp_server_scopes: HashMap<String, Vec<McpServerRule>>,
    #[serde(default)]
    pub agent_scopes: HashMap<String, AgentScope>,
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("group mapping `{group}` references unknown scope `{scope}`")]
    UnknownScopeTarget { group: String, scope: String },
    #[error("duplicate mcp_server_scopes rule in scope `{scope}`: {rule:?}")]
    DuplicateRule { scope: String, rule: McpServerRule },
    #[error("failed to read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse policy document: {0}")]
    Parse(#[from] figment::Error),
}

impl ScopePolicy {
    /// Validate structural invariants described in SPEC_FULL.md §4.1:
    /// every group-mapping target must resolve to a known scope, and
    /// no scope may carry two structurally identical rules.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for (group, scopes) in &self.group_mappings {
            for scope in scopes {
                let known = self.ui_scopes.contains_key(scope)
                    || self.mcp_server_scopes.contains_key(scope)
                    || self.agent_scopes.contains_key(scope);
                if !known {
                    return Err(PolicyError::UnknownScopeTarget {
                        group: group.clone(),
                        scope: scope.clone(),
                    });
                }
            }
        }

        for (scope, rules) in &self.mcp_server_scopes {
            let mut seen: Vec<&McpServerRule> = Vec::new();
            for rule in rules {
                if seen.iter().any(|r| {
                    r.server == rule.server && r.methods == rule.methods && r.tools == rule.tools
                }) {
                    return Err(PolicyError::DuplicateRule {
                        scope: scope.clone(),
                        rule: rule.clone(),
                    });
                }
                seen.push(rule);
            }
        }

        Ok(())
    }

    /// Translate an identity's external groups to internal scope names.
    /// Unknown groups are silently dropped with a warning, per spec.
    pub fn scopes_for_groups(&self, groups: &[String]) -> Vec<String> {
        let mut scopes = Vec::new();
        for group in groups {
            match self.group_mappings.get(group) {
                Some(mapped) => scopes.extend(mapped.iter().cloned()),
                None => warn!(group = %group, "group has no scope mapping, dropping"),
            }
        }
        scopes.sort();
        scopes.dedup();
        scopes
    }

    pub fn rules_for_scopes<'a>(&'a self, scopes: &[String]) -> Vec<&'a McpServerRule> {
        scopes
            .iter()
            .filter_map(|s| self.mcp_server_scopes.get(s))
            .flatten()
            .collect()
    }

    pub fn visible_servers(&self, scopes: &[String], candidates: &[String]) -> Vec<String> {
        candidates
            .iter()
            .filter(|path| {
                scopes
                    .iter()
                    .filter_map(|s| self.ui_scopes.get(s))
                    .any(|ui| ui.allows_server(path))
            })
            .cloned()
            .collect()
    }

    pub fn visible_agents(&self, scopes: &[String], candidates: &[String]) -> Vec<String> {
        candidates
            .iter()
            .filter(|path| {
                scopes
                    .iter()
                    .filter_map(|s| self.ui_scopes.get(s))
                    .any(|ui| ui.allows_agent(path))
            })
            .cloned()
            .collect()
    }

    pub fn agent_action_allowed(&self, scopes: &[String], action: &str, target: &str) -> bool {
        scopes
            .iter()
            .filter_map(|s| self.agent_scopes.get(s))
            .any(|agent_scope| agent_scope.allows(action, target))
    }

    pub fn has_admin_scope(&self, scopes: &[String]) -> bool {
        scopes.iter().any(|s| s == ADMIN_SCOPE)
    }
}

/// Load a `ScopePolicy` document from a YAML file, validating it
/// before returning.
pub fn load_from_file(path: &Path) -> Result<ScopePolicy, PolicyError> {
    use figment::Figment;
    use figment::providers::{Format, Yaml};

    let policy: ScopePolicy = Figment::new()
        .merge(Yaml::file(path))
        .extract()
        .map_err(PolicyError::Parse)?;
    policy.validate()?;
    Ok(policy)
}

/// A hot-reloadable, atomically-swapped policy snapshot (C1).
///
/// Reload either fully succeeds (the snapshot is swapped) or fails
/// with a structured error, leaving the previous snapshot in place --
/// this is the "atomic policy reload" invariant from SPEC_FULL.md §3.
pub struct PolicyStore {
    path: PathBuf,
    current: ArcSwap<ScopePolicy>,
}

impl PolicyStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PolicyError> {
        let path = path.into();
        let policy = load_from_file(&path)?;
        Ok(Self {
            path,
            current: ArcSwap::from_pointee(policy),
        })
    }

    pub fn current(&self) -> Arc<ScopePolicy> {
        self.current.load_full()
    }

    /// Reload the policy from disk. On parse/validation failure the
    /// previously loaded snapshot remains current and is returned
    /// unchanged to the caller via the `Err` variant.
    pub fn reload(&self) -> Result<Arc<ScopePolicy>, PolicyError> {
        let policy = load_from_file(&self.path)?;
        self.current.store(Arc::new(policy));
        info!(path = %self.path.display(), "scope policy reloaded");
        Ok(self.current.load_full())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_policy() -> ScopePolicy {
        let mut group_mappings = HashMap::new();
        group_mappings.insert("lob1".to_string(), vec!["lob1-ro".to_string()]);

        let mut mcp_server_scopes = HashMap::new();
        mcp_server_scopes.insert(
            "lob1-ro".to_string(),
            vec![McpServerRule {
                server: "/currenttime".to_string(),
                methods: vec![WILDCARD.to_string()],
                tools: vec![WILDCARD.to_string()],
            }],
        );

        ScopePolicy {
            group_mappings,
            ui_scopes: HashMap::new(),
            mcp_server_scopes,
            agent_scopes: HashMap::new(),
        }
    }

    #[test]
    fn validate_rejects_unknown_scope_target() {
        let mut policy = sample_policy();
        policy
            .group_mappings
            .insert("lob2".to_string(), vec!["missing-scope".to_string()]);
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::UnknownScopeTarget { .. })
        ));
    }

    #[test]
    fn scopes_for_groups_drops_unknown_groups() {
        let policy = sample_policy();
        let scopes = policy.scopes_for_groups(&["lob1".to_string(), "unknown".to_string()]);
        assert_eq!(scopes, vec!["lob1-ro".to_string()]);
    }

    #[test]
    fn rule_matches_wildcard_tools() {
        let policy = sample_policy();
        let rules = policy.rules_for_scopes(&["lob1-ro".to_string()]);
        assert!(rules[0].matches("/currenttime", "tools/call", Some("current_time_by_timezone")));
        assert!(!rules[0].matches("/weather", "tools/call", Some("anything")));
    }
}
