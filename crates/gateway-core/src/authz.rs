//! Authorization Engine (C4): a pure function of (Identity, Request)
//! and the currently loaded scope policy. No I/O, fully unit-testable.

use crate::model::{DenyReason, Identity};
use crate::scope::ScopePolicy;

#[derive(Debug, Clone)]
pub enum McpMethod {
    ToolsCall { tool_name: String },
    Other(String),
}

impl McpMethod {
    pub fn name(&self) -> &str {
        match self {
            McpMethod::ToolsCall { .. } => "tools/call",
            McpMethod::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct McpCallRequest<'a> {
    pub server_path: &'a str,
    pub method: McpMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    RegisterServer,
    EditServer,
    DeleteServer,
    ToggleServer,
    RescanServer,
    RegisterAgent,
    EditAgent,
    DeleteAgent,
    ToggleAgent,
    ViewAudit,
    /// Allowed to any authenticated caller, not only admins.
    Rate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allow(self) -> bool {
        matches!(self, Decision::Allow)
    }
}

pub struct AuthorizationEngine;

impl AuthorizationEngine {
    /// Decide access for a forwarded MCP call. Implements the
    /// algorithm from SPEC_FULL.md §4.4: translate groups to scopes,
    /// collect all matching rules, deny-by-default, first match wins
    /// (rules are additive/union, not prioritized).
    pub fn authorize_mcp_call(
        policy: &ScopePolicy,
        identity: &Identity,
        request: &McpCallRequest<'_>,
        server_enabled: bool,
    ) -> Decision {
        if !server_enabled {
            return Decision::Deny(DenyReason::ServerDisabled);
        }

        let scopes = policy.scopes_for_groups(&identity.groups);
        let rules = policy.rules_for_scopes(&scopes);

        let tool_name = match &request.method {
            McpMethod::ToolsCall { tool_name } => Some(tool_name.as_str()),
            McpMethod::Other(_) => None,
        };

        let matched = rules
            .iter()
            .any(|rule| rule.matches(request.server_path, request.method.name(), tool_name));

        if matched {
            Decision::Allow
        } else {
            Decision::Deny(DenyReason::NoMatchingRule)
        }
    }

    /// Decide access for an admin action. `rate` is permitted to any
    /// authenticated caller; everything else requires the
    /// `registry-admins` scope.
    pub fn authorize_admin_action(
        policy: &ScopePolicy,
        identity: &Identity,
        action: AdminAction,
    ) -> Decision {
        if action == AdminAction::Rate {
            return Decision::Allow;
        }
        let scopes = policy.scopes_for_groups(&identity.groups);
        if policy.has_admin_scope(&scopes) {
            Decision::Allow
        } else {
            Decision::Deny(DenyReason::NoMatchingRule)
        }
    }

    /// Filter a candidate list of server paths down to those visible
    /// to the identity, per its `ui_scopes.visible_servers`.
    pub fn filter_visible_servers(
        policy: &ScopePolicy,
        identity: &Identity,
        candidates: &[String],
    ) -> Vec<String> {
        let scopes = policy.scopes_for_groups(&identity.groups);
        policy.visible_servers(&scopes, candidates)
    }

    pub fn filter_visible_agents(
        policy: &ScopePolicy,
        identity: &Identity,
        candidates: &[String],
    ) -> Vec<String> {
        let scopes = policy.scopes_for_groups(&identity.groups);
        policy.visible_agents(&scopes, candidates)
    }

    pub fn authorize_agent_action(
        policy: &ScopePolicy,
        identity: &Identity,
        action: &str,
        target: &str,
    ) -> Decision {
        let scopes = policy.scopes_for_groups(&identity.groups);
        if policy.agent_action_allowed(&scopes, action, target) {
            Decision::Allow
        } else {
            Decision::Deny(DenyReason::NoMatchingRule)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::McpServerRule;
    use chrono::Utc;
    use std::collections::HashMap;

    fn identity(groups: &[&str]) -> Identity {
        Identity {
            subject: "user-1".to_string(),
            display_name: None,
            groups: groups.iter().map(|s| s.to_string()).collect(),
            token_expiry: Utc::now() + chrono::Duration::hours(1),
            raw_claims: serde_json::json!({}),
        }
    }

    fn policy_s1_s2() -> ScopePolicy {
        let mut group_mappings = HashMap::new();
        group_mappings.insert("lob1".to_string(), vec!["lob1-ro".to_string()]);

        let mut mcp_server_scopes = HashMap::new();
        mcp_server_scopes.insert(
            "lob1-ro".to_string(),
            vec![McpServerRule {
                server: "/currenttime".to_string(),
                methods: vec!["*".to_string()],
                tools: vec!["*".to_string()],
            }],
        );

        ScopePolicy {
            group_mappings,
            ui_scopes: HashMap::new(),
            mcp_server_scopes,
            agent_scopes: HashMap::new(),
        }
    }

    /// S1 -- permitted tool call.
    #[test]
    fn s1_permitted_tool_call() {
        let policy = policy_s1_s2();
        let identity = identity(&["lob1"]);
        let request = McpCallRequest {
            server_path: "/currenttime",
            method: McpMethod::ToolsCall {
                tool_name: "current_time_by_timezone".to_string(),
            },
        };
        let decision = AuthorizationEngine::authorize_mcp_call(&policy, &identity, &request, true);
        assert_eq!(decision, Decision::Allow);
    }

    /// S2 -- forbidden tool call, no rule grants lob2 access.
    #[test]
    fn s2_forbidden_tool_call() {
        let policy = policy_s1_s2();
        let identity = identity(&["lob2"]);
        let request = McpCallRequest {
            server_path: "/currenttime",
            method: McpMethod::ToolsCall {
                tool_name: "current_time_by_timezone".to_string(),
            },
        };
        let decision = AuthorizationEngine::authorize_mcp_call(&policy, &identity, &request, true);
        assert_eq!(decision, Decision::Deny(DenyReason::NoMatchingRule));
    }

    #[test]
    fn disabled_server_always_denied() {
        let policy = policy_s1_s2();
        let identity = identity(&["lob1"]);
        let request = McpCallRequest {
            server_path: "/currenttime",
            method: McpMethod::Other("ping".to_string()),
        };
        let decision =
            AuthorizationEngine::authorize_mcp_call(&policy, &identity, &request, false);
        assert_eq!(decision, Decision::Deny(DenyReason::ServerDisabled));
    }

    /// Boundary case: a token with zero groups authorizes nothing
    /// unless a rule is attached to a scope reachable from no groups
    /// at all (i.e. never, under normal policies).
    #[test]
    fn zero_groups_denies_everything_not_wildcarded() {
        let policy = policy_s1_s2();
        let identity = identity(&[]);
        let request = McpCallRequest {
            server_path: "/currenttime",
            method: McpMethod::ToolsCall {
                tool_name: "anything".to_string(),
            },
        };
        let decision = AuthorizationEngine::authorize_mcp_call(&policy, &identity, &request, true);
        assert_eq!(decision, Decision::Deny(DenyReason::NoMatchingRule));
    }

    /// Boundary case: `server: "*", methods: ["*"], tools: ["*"]`
    /// grants universal MCP access.
    #[test]
    fn universal_wildcard_rule_grants_everything() {
        let mut group_mappings = HashMap::new();
        group_mappings.insert("anyone".to_string(), vec!["universal".to_string()]);
        let mut mcp_server_scopes = HashMap::new();
        mcp_server_scopes.insert(
            "universal".to_string(),
            vec![McpServerRule {
                server: "*".to_string(),
                methods: vec!["*".to_string()],
                tools: vec!["*".to_string()],
            }],
        );
        let policy = ScopePolicy {
            group_mappings,
            ui_scopes: HashMap::new(),
            mcp_server_scopes,
            agent_scopes: HashMap::new(),
        };
        let identity = identity(&["anyone"]);
        let request = McpCallRequest {
            server_path: "/anything-at-all",
            method: McpMethod::ToolsCall {
                tool_name: "whatever".to_string(),
            },
        };
        let decision = AuthorizationEngine::authorize_mcp_call(&policy, &identity, &request, true);
        assert_eq!(decision, Decision::Allow);
    }

    /// S3 -- listing filter.
    #[test]
    fn s3_listing_filter() {
        use crate::scope::UiScope;
        let mut group_mappings = HashMap::new();
        group_mappings.insert("grp1".to_string(), vec!["foo".to_string()]);
        let mut ui_scopes = HashMap::new();
        ui_scopes.insert(
            "foo".to_string(),
            UiScope {
                visible_servers: vec!["/a".to_string(), "/c".to_string()],
                visible_agents: vec![],
            },
        );
        let policy = ScopePolicy {
            group_mappings,
            ui_scopes,
            mcp_server_scopes: HashMap::new(),
            agent_scopes: HashMap::new(),
        };
        let identity = identity(&["grp1"]);
        let candidates = vec!["/a".to_string(), "/b".to_string(), "/c".to_string()];
        let visible = AuthorizationEngine::filter_visible_servers(&policy, &identity, &candidates);
        assert_eq!(visible, vec!["/a".to_string(), "/c".to_string()]);
    }
}
