//! A single health probe against one upstream server: `initialize`
//! followed by `ping`, classified into the shared `HealthStatus`.

use std::time::Duration;

use gateway_core::model::HealthStatus;
use rmcp::model::{ClientCapabilities, ClientInfo, Implementation};
use serde_json::{Value, json};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned HTTP {0}, our credentials are stale")]
    AuthExpired(reqwest::StatusCode),
    #[error("upstream returned HTTP {0}")]
    HttpError(reqwest::StatusCode),
    #[error("upstream returned a JSON-RPC error: {code} {message}")]
    Rpc { code: i64, message: String },
    #[error("upstream response was not valid JSON-RPC: {0}")]
    MalformedResponse(String),
}

/// Probe an upstream MCP server reachable at `url` over streamable
/// HTTP, classifying the outcome per SPEC_FULL.md §4.6: a successful
/// `initialize` + `ping` round trip is `Healthy`; an HTTP or JSON-RPC
/// 401/403-shaped response is `HealthyAuthExpired` (the server is
/// alive, just currently unauthenticated against our stored
/// credentials); anything else is `Unhealthy`.
pub async fn probe(
    client: &reqwest::Client,
    url: &Url,
    headers: &reqwest::header::HeaderMap,
    timeout: Duration,
) -> HealthStatus {
    match probe_inner(client, url, headers, timeout).await {
        Ok(()) => HealthStatus::Healthy,
        Err(ProbeError::AuthExpired(_)) => HealthStatus::HealthyAuthExpired,
        Err(ProbeError::Rpc { code, .. }) if is_auth_error(code) => HealthStatus::HealthyAuthExpired,
        Err(_) => HealthStatus::Unhealthy,
    }
}

async fn probe_inner(
    client: &reqwest::Client,
    url: &Url,
    headers: &reqwest::header::HeaderMap,
    timeout: Duration,
) -> Result<(), ProbeError> {
    send(client, url, headers.clone(), timeout, initialize_request()).await?;
    send(client, url, headers.clone(), timeout, ping_request()).await?;
    Ok(())
}

async fn send(
    client: &reqwest::Client,
    url: &Url,
    headers: reqwest::header::HeaderMap,
    timeout: Duration,
    body: Value,
) -> Result<(), ProbeError> {
    let response = client
        .post(url.clone())
        .headers(headers)
        .timeout(timeout)
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ProbeError::AuthExpired(status));
    }
    if !status.is_success() {
        return Err(ProbeError::HttpError(status));
    }

    let payload: Value = response.json().await?;
    if let Some(error) = payload.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(ProbeError::Rpc { code, message });
    }
    if payload.get("result").is_none() {
        return Err(ProbeError::MalformedResponse(payload.to_string()));
    }
    Ok(())
}

/// Authentication/authorization JSON-RPC error codes per the MCP spec's
/// convention of mapping HTTP 401/403 onto JSON-RPC error codes in the
/// -32000 application-defined range, for upstreams that report auth
/// failure inside a 200 JSON-RPC envelope rather than via HTTP status.
/// Treated as "server reachable but our credentials expired" rather
/// than "server down".
fn is_auth_error(code: i64) -> bool {
    matches!(code, -32001 | -32002)
}

fn initialize_request() -> Value {
    let client_info = ClientInfo {
        protocol_version: Default::default(),
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "mcp-gateway-registry-health-probe".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": client_info,
    })
}

fn ping_request() -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "ping",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use reqwest::header::HeaderMap;

    #[tokio::test]
    async fn healthy_upstream_classified_healthy() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/mcp")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)
            .expect(2)
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/mcp", server.url())).unwrap();
        let client = reqwest::Client::new();
        let status = probe(&client, &url, &HeaderMap::new(), Duration::from_secs(5)).await;
        assert_eq!(status, HealthStatus::Healthy);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_401_classified_healthy_auth_expired() {
        let mut server = Server::new_async().await;
        server.mock("POST", "/mcp").with_status(401).create_async().await;

        let url = Url::parse(&format!("{}/mcp", server.url())).unwrap();
        let client = reqwest::Client::new();
        let status = probe(&client, &url, &HeaderMap::new(), Duration::from_secs(5)).await;
        assert_eq!(status, HealthStatus::HealthyAuthExpired);
    }

    #[tokio::test]
    async fn jsonrpc_auth_error_classified_healthy_auth_expired() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/mcp")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32001,"message":"token expired"}}"#)
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/mcp", server.url())).unwrap();
        let client = reqwest::Client::new();
        let status = probe(&client, &url, &HeaderMap::new(), Duration::from_secs(5)).await;
        assert_eq!(status, HealthStatus::HealthyAuthExpired);
    }

    #[tokio::test]
    async fn unreachable_upstream_classified_unhealthy() {
        let url = Url::parse("http://127.0.0.1:1/mcp").unwrap();
        let client = reqwest::Client::new();
        let status = probe(&client, &url, &HeaderMap::new(), Duration::from_millis(200)).await;
        assert_eq!(status, HealthStatus::Unhealthy);
    }
}
