use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use std::{error::Error as StdError, time::Duration};
use tracing::{info, warn};

/// Configuration for the smoke client
pub struct SmokeClientConfig {
    /// Base URL of a running bridge, e.g. `http://localhost:8080`.
    pub url: String,
    /// How long to listen on `/sse` before giving up.
    pub sse_timeout: Duration,
}

/// What a running bridge answered.
#[derive(Debug, Clone, PartialEq)]
pub struct SmokeReport {
    pub connected: bool,
    pub sse_events: usize,
    pub tools: Vec<String>,
}

/// Exercise a running bridge: health check, SSE stream, then `tools/list`.
pub async fn run_smoke_client(config: SmokeClientConfig) -> Result<SmokeReport, Box<dyn StdError>> {
    let base = config.url.trim_end_matches('/').to_string();
    info!("Running smoke checks against {}", base);

    let http_client = HttpClient::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let health: Value = http_client
        .get(format!("{base}/health"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    if health["status"] != "ok" {
        return Err(format!("unexpected health response: {health}").into());
    }
    let connected = health["connected"].as_bool().unwrap_or(false);
    info!("Health check passed (connected to MATLAB: {})", connected);

    let sse_events = count_sse_events(&base, config.sse_timeout).await?;
    if sse_events == 0 {
        warn!("No SSE events received within {:?}", config.sse_timeout);
    } else {
        info!("SSE connection test passed ({} events)", sse_events);
    }

    let request = json!({
        "jsonrpc": "2.0",
        "id": format!("test-{}", chrono::Utc::now().timestamp_millis()),
        "method": "tools/list",
        "params": {}
    });
    let response = http_client
        .post(format!("{base}/mcp"))
        .json(&request)
        .send()
        .await?;
    let status = response.status();
    let body: Value = response.json().await?;
    if !status.is_success() {
        return Err(format!("MCP request failed with HTTP {status}: {body}").into());
    }
    if body["id"] != request["id"] {
        return Err(format!("response id {} does not match request", body["id"]).into());
    }

    let tools: Vec<String> = body["result"]["tools"]
        .as_array()
        .map(|tools| {
            tools
                .iter()
                .filter_map(|tool| tool["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    info!("MCP request test passed ({} tools)", tools.len());

    Ok(SmokeReport {
        connected,
        sse_events,
        tools,
    })
}

/// Counts `event:` fields seen on `/sse` until the stream ends or `limit` elapses.
/// Stops early once two events have arrived.
async fn count_sse_events(base: &str, limit: Duration) -> Result<usize, Box<dyn StdError>> {
    // No client-wide timeout here: the stream is meant to stay open.
    let sse_client = HttpClient::new();
    let mut response = sse_client
        .get(format!("{base}/sse"))
        .header("Accept", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .send()
        .await?
        .error_for_status()?;

    let deadline = tokio::time::Instant::now() + limit;
    let mut events = 0;
    while events < 2 {
        match tokio::time::timeout_at(deadline, response.chunk()).await {
            Ok(Ok(Some(chunk))) => {
                let text = String::from_utf8_lossy(&chunk);
                events += text
                    .lines()
                    .filter(|line| line.starts_with("event:"))
                    .count();
            }
            Ok(Ok(None)) => break,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => break,
        }
    }
    Ok(events)
}
