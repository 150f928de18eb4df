//! Domain types shared by every component of the gateway: server and
//! agent records, tool/skill descriptors, identities and audit entries.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A URL-safe identifier used as both a storage key and a routing prefix.
///
/// Unique within its kind (server or agent) and stable for the lifetime
/// of the record it names. The canonical form always carries exactly
/// one leading slash and no trailing slash (`/currenttime`,
/// `/teams/a`) -- this is the same form scope-policy documents write
/// server/agent paths in, so a policy's `visible_servers`/`server`
/// entries can be compared against `RecordPath::as_str()` directly
/// without either side normalizing first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "String", into = "String")]
pub struct RecordPath(String);

impl RecordPath {
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidPath> {
        let raw = raw.into();
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Err(InvalidPath::Empty);
        }
        if trimmed.contains("//")
            || !trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '/')
        {
            return Err(InvalidPath::Illegal(raw));
        }
        Ok(Self(format!("/{trimmed}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for RecordPath {
    type Error = InvalidPath;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RecordPath> for String {
    fn from(value: RecordPath) -> Self {
        value.0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidPath {
    #[error("path must not be empty")]
    Empty,
    #[error("path `{0}` contains characters outside [A-Za-z0-9_-/]")]
    Illegal(String),
}

/// MCP transports a server may be reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Stdio,
    Sse,
    StreamableHttp,
}

/// A single templated header to send upstream. `${VAR}` segments are
/// resolved against the process environment at load/reload time, not
/// per forwarded request, so the proxy's hot path never re-scans the
/// template string (see SPEC_FULL.md §3.2).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HeaderTemplate {
    pub name: String,
    pub template: String,
}

impl HeaderTemplate {
    /// Resolve `${VAR}` references against the process environment,
    /// leaving unresolvable references in place rather than failing --
    /// a missing env var degrades the header, not the gateway.
    pub fn resolve(&self) -> String {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let var = &after[..end];
                    if let Ok(value) = std::env::var(var) {
                        out.push_str(&value);
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                    break;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Health classification shared by servers and agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    HealthyAuthExpired,
    Unhealthy,
}

/// Part of a parsed docstring: the main summary plus structured
/// argument/return/raise documentation lifted from the upstream tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ParsedDescription {
    pub main: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub returns: Option<String>,
    #[serde(default)]
    pub raises: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub parsed_description: ParsedDescription,
    pub schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SkillDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ServerRecord {
    pub path: RecordPath,
    pub server_name: String,
    pub description: String,
    pub proxy_pass_url: url::Url,
    pub supported_transports: BTreeSet<Transport>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub headers: Vec<HeaderTemplate>,
    #[serde(default)]
    pub tool_list: Vec<ToolDescriptor>,
    #[serde(default)]
    pub resource_list: Vec<String>,
    #[serde(default)]
    pub num_stars: RatingAggregate,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub is_python: bool,

    // Mutable fields.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub health_status: HealthStatus,
    #[serde(default)]
    pub last_checked_time: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Community,
    Verified,
    Trusted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentRecord {
    pub path: RecordPath,
    pub name: String,
    pub description: String,
    pub url: url::Url,
    pub version: String,
    #[serde(default)]
    pub skills: Vec<SkillDescriptor>,
    #[serde(default)]
    pub security_schemes: Vec<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub visibility: Visibility,
    pub trust_level: TrustLevel,

    // Mutable fields, semantics identical to ServerRecord.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub health_status: HealthStatus,
    #[serde(default)]
    pub last_checked_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub num_stars: RatingAggregate,
}

/// Aggregate star rating. Resolves Open Question #2 from SPEC_FULL.md:
/// `num_stars` is an average of all submitted ratings, rounded to one
/// decimal place, recomputed on every new rating.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema)]
pub struct RatingAggregate {
    /// Average rounded to one decimal place, as persisted/displayed.
    pub average: f64,
    pub count: u64,
}

impl RatingAggregate {
    pub fn with_rating(self, rating: u8) -> Result<Self, RatingError> {
        if !(1..=5).contains(&rating) {
            return Err(RatingError::OutOfRange(rating));
        }
        let total = self.average * self.count as f64 + rating as f64;
        let count = self.count + 1;
        let average = (total / count as f64 * 10.0).round() / 10.0;
        Ok(Self { average, count })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RatingError {
    #[error("rating {0} out of range 1..=5")]
    OutOfRange(u8),
}

/// An identity derived from a validated bearer token. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    pub display_name: Option<String>,
    pub groups: Vec<String>,
    pub token_expiry: DateTime<Utc>,
    pub raw_claims: serde_json::Value,
}

/// The kind of record an admin action or audit entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Server,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    McpCall,
    RegisterServer,
    EditServer,
    DeleteServer,
    ToggleServer,
    RescanServer,
    RegisterAgent,
    EditAgent,
    DeleteAgent,
    ToggleAgent,
    Rate,
    ViewAudit,
    PolicyReload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny { reason: DenyReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NoMatchingRule,
    ServerNotFound,
    ServerDisabled,
    TokenExpired,
    MethodNotPermitted,
    ToolNotPermitted,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub subject: String,
    pub action: AuditAction,
    pub target: String,
    pub decision: Decision,
    #[serde(default)]
    pub delta: Option<serde_json::Value>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Common shape shared by `ServerRecord` and `AgentRecord` so the
/// repository backends can be generic over "kind of record" instead
/// of duplicated per kind.
pub trait Keyed {
    fn path(&self) -> &RecordPath;
    fn enabled(&self) -> bool;
    fn set_enabled(&mut self, enabled: bool);
    fn set_health(&mut self, status: HealthStatus, checked_at: DateTime<Utc>);
    fn apply_rating(&mut self, rating: u8) -> Result<(), RatingError>;
}

impl Keyed for ServerRecord {
    fn path(&self) -> &RecordPath {
        &self.path
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn set_health(&mut self, status: HealthStatus, checked_at: DateTime<Utc>) {
        self.health_status = status;
        self.last_checked_time = Some(checked_at);
    }

    fn apply_rating(&mut self, rating: u8) -> Result<(), RatingError> {
        self.num_stars = self.num_stars.with_rating(rating)?;
        Ok(())
    }
}

impl Keyed for AgentRecord {
    fn path(&self) -> &RecordPath {
        &self.path
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    fn set_health(&mut self, status: HealthStatus, checked_at: DateTime<Utc>) {
        self.health_status = status;
        self.last_checked_time = Some(checked_at);
    }

    fn apply_rating(&mut self, rating: u8) -> Result<(), RatingError> {
        self.num_stars = self.num_stars.with_rating(rating)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_path_rejects_empty_and_illegal() {
        assert!(RecordPath::new("").is_err());
        assert!(RecordPath::new("has space").is_err());
        assert!(RecordPath::new("//weather").is_err());
        assert_eq!(RecordPath::new("/weather/").unwrap().as_str(), "/weather");
        assert_eq!(RecordPath::new("weather").unwrap().as_str(), "/weather");
    }

    #[test]
    fn header_template_resolves_known_and_leaves_unknown() {
        let t = HeaderTemplate {
            name: "Authorization".into(),
            template: "Bearer ${UNIT_TEST_TOKEN_VAR}".into(),
        };
        unsafe {
            std::env::set_var("UNIT_TEST_TOKEN_VAR", "abc123");
        }
        assert_eq!(t.resolve(), "Bearer abc123");
        unsafe {
            std::env::remove_var("UNIT_TEST_TOKEN_VAR");
        }
        assert_eq!(t.resolve(), "Bearer ");
    }

    #[test]
    fn rating_average_rounds_to_one_decimal() {
        let r = RatingAggregate::default();
        let r = r.with_rating(5).unwrap();
        let r = r.with_rating(4).unwrap();
        assert_eq!(r.count, 2);
        assert_eq!(r.average, 4.5);

        let r2 = RatingAggregate::default().with_rating(3).unwrap();
        let r2 = r2.with_rating(4).unwrap();
        let r2 = r2.with_rating(4).unwrap();
        // (3+4+4)/3 = 3.666... -> 3.7
        assert_eq!(r2.average, 3.7);
    }

    #[test]
    fn rating_out_of_range_rejected() {
        assert!(RatingAggregate::default().with_rating(0).is_err());
        assert!(RatingAggregate::default().with_rating(6).is_err());
    }
}
