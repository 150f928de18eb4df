//! Minimal JSON-RPC envelope inspection: the router only needs
//! `method` and, for `tools/call`, `params.name` -- it never
//! interprets the rest of the payload, which is forwarded unchanged.

use gateway_core::authz::McpMethod;

pub fn parse_method(body: &[u8]) -> Option<McpMethod> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let method = value.get("method")?.as_str()?.to_string();
    if method == "tools/call" {
        let tool_name = value
            .get("params")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .map(str::to_string)?;
        Some(McpMethod::ToolsCall { tool_name })
    } else {
        Some(McpMethod::Other(method))
    }
}
