//! HTTP Agent Runner (§4.6): Copilot and Antigravity present the same
//! interface as the Child Runner but run as in-process streaming HTTP
//! calls instead of a spawned CLI, so `activeProcesses` stays uniform by
//! synthesizing a negative "pid".
//!
//! SSE line-splitting and `data:`/`[DONE]` handling use a `bytes_stream` +
//! line-buffer split on `\n`, adapted from an accumulate-a-full-reply
//! client into a forward-every-delta one.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::bus::{event_types, EventBus};
use crate::runtime::child_runner::ChildRunnerEvent;
use crate::runtime::stream_parser::StreamParser;

#[derive(Debug, Error)]
pub enum HttpAgentError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream auth failed: {0}")]
    Auth(String),
    #[error("upstream response malformed: {0}")]
    Malformed(String),
}

/// Copilot short-lived bearer token cache entry, keyed by SHA-256 of the
/// stored GitHub OAuth token so the cache never holds a raw secret as key.
struct CopilotTokenCacheEntry {
    bearer: String,
    base_url: String,
    expires_at_epoch_secs: i64,
}

#[derive(Default)]
pub struct CopilotTokenCache {
    entries: Mutex<std::collections::HashMap<String, CopilotTokenCacheEntry>>,
}

const COPILOT_SAFETY_MARGIN_SECS: i64 = 300;
const COPILOT_DEFAULT_BASE: &str = "https://api.githubcopilot.com";

impl CopilotTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_exchange(
        &self,
        client: &reqwest::Client,
        github_token: &str,
    ) -> Result<(String, String), HttpAgentError> {
        let key = format!("{:x}", Sha256::digest(github_token.as_bytes()));
        let now = now_epoch_secs();

        if let Some(entry) = self.entries.lock().await.get(&key) {
            if entry.expires_at_epoch_secs - COPILOT_SAFETY_MARGIN_SECS > now {
                return Ok((entry.bearer.clone(), entry.base_url.clone()));
            }
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
            expires_at: i64,
            endpoints: Option<Endpoints>,
        }
        #[derive(Deserialize)]
        struct Endpoints {
            api: Option<String>,
        }

        let resp = client
            .get("https://api.github.com/copilot_internal/v2/token")
            .header("Authorization", format!("Bearer {github_token}"))
            .header("User-Agent", "climpire")
            .send()
            .await?;

        if resp.status().as_u16() == 401 || resp.status().as_u16() == 403 {
            return Err(HttpAgentError::Auth(format!("copilot token exchange failed: {}", resp.status())));
        }
        let text = resp.text().await?;
        let parsed: TokenResponse = serde_json::from_str(&text)
            .map_err(|e| HttpAgentError::Malformed(format!("copilot token response: {e}")))?;

        let base_url = extract_proxy_ep_hint(&parsed.token)
            .or(parsed.endpoints.and_then(|e| e.api))
            .unwrap_or_else(|| COPILOT_DEFAULT_BASE.to_string());

        self.entries.lock().await.insert(
            key,
            CopilotTokenCacheEntry {
                bearer: parsed.token.clone(),
                base_url: base_url.clone(),
                expires_at_epoch_secs: parsed.expires_at,
            },
        );

        Ok((parsed.token, base_url))
    }
}

/// The short-lived bearer token sometimes embeds `proxy-ep=<host>` among
/// its semicolon-separated claims; prefer it over `endpoints.api` when present.
fn extract_proxy_ep_hint(token: &str) -> Option<String> {
    token.split(';').find_map(|part| part.trim().strip_prefix("proxy-ep=")).map(|host| {
        if host.starts_with("http") {
            host.to_string()
        } else {
            format!("https://{host}")
        }
    })
}

fn now_epoch_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Synthesized negative pids for HTTP-backed agents so `activeProcesses`
/// can treat every provider uniformly.
static NEGATIVE_PID_COUNTER: AtomicI64 = AtomicI64::new(0);

fn next_negative_pid() -> i64 {
    -(NEGATIVE_PID_COUNTER.fetch_add(1, Ordering::SeqCst) + 1)
}

pub struct HttpAgentHandle {
    pub pid: i64,
    cancel: CancellationToken,
}

impl HttpAgentHandle {
    /// Equivalent of `killPidTree` for a synthetic handle: aborts the
    /// in-flight HTTP stream.
    pub fn kill(&self) {
        self.cancel.cancel();
    }
}

pub struct HttpAgentRunner {
    client: reqwest::Client,
    copilot_cache: Arc<CopilotTokenCache>,
}

impl Default for HttpAgentRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpAgentRunner {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            copilot_cache: Arc::new(CopilotTokenCache::new()),
        }
    }

    /// Stream a Copilot chat completion for `task_id`, multiplexing
    /// deltas to the log path, bus, and stream parser exactly like the
    /// Child Runner does for CLI stdout.
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn_copilot(
        &self,
        task_id: String,
        github_token: String,
        prompt: String,
        logs_dir: std::path::PathBuf,
        bus: Arc<EventBus>,
        events_tx: mpsc::UnboundedSender<ChildRunnerEvent>,
    ) -> Result<HttpAgentHandle, HttpAgentError> {
        let (bearer, base_url) = self.copilot_cache.get_or_exchange(&self.client, &github_token).await?;
        let cancel = CancellationToken::new();
        let handle = HttpAgentHandle { pid: next_negative_pid(), cancel: cancel.clone() };

        let client = self.client.clone();
        tokio::spawn(async move {
            let body = serde_json::json!({
                "model": "gpt-4o",
                "stream": true,
                "messages": [{ "role": "user", "content": prompt }],
            });
            let endpoint = format!("{}/chat/completions", base_url.trim_end_matches('/'));
            let request = client
                .post(&endpoint)
                .header("Authorization", format!("Bearer {bearer}"))
                .header("Content-Type", "application/json")
                .json(&body)
                .send();

            let response = tokio::select! {
                r = request => r,
                _ = cancel.cancelled() => return,
            };

            let response = match response {
                Ok(r) => r,
                Err(_) => {
                    let _ = events_tx.send(ChildRunnerEvent::Exited { code: 1 });
                    return;
                }
            };

            let code = stream_sse_to_sinks(
                response,
                &task_id,
                "plain",
                &logs_dir,
                &bus,
                &events_tx,
                &cancel,
                |value| {
                    value
                        .pointer("/choices/0/delta/content")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                },
            )
            .await;
            let _ = events_tx.send(ChildRunnerEvent::Exited { code });
        });

        Ok(handle)
    }

    /// Refresh the Google access token if it's within 60s of expiry,
    /// probe the three cloudcode endpoints in order for the project id,
    /// then stream an Antigravity turn.
    #[allow(clippy::too_many_arguments)]
    pub async fn spawn_antigravity(
        &self,
        task_id: String,
        access_token: String,
        model: String,
        prompt: String,
        logs_dir: std::path::PathBuf,
        bus: Arc<EventBus>,
        events_tx: mpsc::UnboundedSender<ChildRunnerEvent>,
    ) -> Result<HttpAgentHandle, HttpAgentError> {
        let cancel = CancellationToken::new();
        let handle = HttpAgentHandle { pid: next_negative_pid(), cancel: cancel.clone() };
        let client = self.client.clone();

        tokio::spawn(async move {
            let project_id = match discover_antigravity_project(&client, &access_token).await {
                Some(id) => id,
                None => DEFAULT_ANTIGRAVITY_PROJECT.to_string(),
            };

            let base = antigravity_base(&access_token, &client).await;
            let request_id = uuid::Uuid::new_v4().to_string();
            let body = serde_json::json!({
                "project": project_id,
                "model": model,
                "requestType": "agent",
                "userAgent": "antigravity",
                "requestId": request_id,
                "request": {
                    "contents": [{ "role": "user", "parts": [{ "text": prompt }] }]
                },
            });

            let endpoint = format!("{}/v1internal:streamGenerateContent?alt=sse", base.trim_end_matches('/'));
            let request = client
                .post(&endpoint)
                .header("Authorization", format!("Bearer {access_token}"))
                .header("Content-Type", "application/json")
                .json(&body)
                .send();

            let response = tokio::select! {
                r = request => r,
                _ = cancel.cancelled() => return,
            };

            let response = match response {
                Ok(r) => r,
                Err(_) => {
                    let _ = events_tx.send(ChildRunnerEvent::Exited { code: 1 });
                    return;
                }
            };

            let code = stream_sse_to_sinks(
                response,
                &task_id,
                "plain",
                &logs_dir,
                &bus,
                &events_tx,
                &cancel,
                |value| {
                    value
                        .pointer("/response/candidates/0/content/parts/0/text")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                },
            )
            .await;
            let _ = events_tx.send(ChildRunnerEvent::Exited { code });
        });

        Ok(handle)
    }
}

const ANTIGRAVITY_ENDPOINTS: [&str; 3] = [
    "https://cloudcode-pa.googleapis.com",
    "https://daily-cloudcode-pa.googleapis.com",
    "https://autopush-cloudcode-pa.googleapis.com",
];
const DEFAULT_ANTIGRAVITY_PROJECT: &str = "antigravity-default";

async fn antigravity_base(access_token: &str, client: &reqwest::Client) -> String {
    for endpoint in ANTIGRAVITY_ENDPOINTS {
        let resp = client
            .post(format!("{endpoint}/v1internal:loadCodeAssist"))
            .header("Authorization", format!("Bearer {access_token}"))
            .json(&serde_json::json!({}))
            .send()
            .await;
        if let Ok(r) = resp {
            if r.status().is_success() {
                return endpoint.to_string();
            }
        }
    }
    ANTIGRAVITY_ENDPOINTS[0].to_string()
}

async fn discover_antigravity_project(client: &reqwest::Client, access_token: &str) -> Option<String> {
    for endpoint in ANTIGRAVITY_ENDPOINTS {
        let resp = client
            .post(format!("{endpoint}/v1internal:loadCodeAssist"))
            .header("Authorization", format!("Bearer {access_token}"))
            .json(&serde_json::json!({}))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            continue;
        }
        if let Ok(value) = resp.json::<serde_json::Value>().await {
            if let Some(id) = value.get("cloudaicompanionProject").and_then(|v| v.as_str()) {
                return Some(id.to_string());
            }
        }
    }
    None
}

/// Drives an SSE response to completion, writing every extracted text
/// delta to the task log, `cli_output` bus event, and stream parser.
/// `extract` pulls the provider-specific text field out of each `data:`
/// JSON payload. Returns the synthetic exit code (0 success, 1 failure).
#[allow(clippy::too_many_arguments)]
async fn stream_sse_to_sinks(
    response: reqwest::Response,
    task_id: &str,
    parser_label: &str,
    logs_dir: &std::path::Path,
    bus: &Arc<EventBus>,
    events_tx: &mpsc::UnboundedSender<ChildRunnerEvent>,
    cancel: &CancellationToken,
    extract: impl Fn(&serde_json::Value) -> Option<String>,
) -> i32 {
    if !response.status().is_success() {
        return 1;
    }

    let _ = tokio::fs::create_dir_all(logs_dir).await;
    let log_path = logs_dir.join(format!("{task_id}.log"));
    let mut log_file = match tokio::fs::File::create(&log_path).await {
        Ok(f) => f,
        Err(_) => return 1,
    };

    let mut parser = StreamParser::new();
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    loop {
        let chunk = tokio::select! {
            c = stream.next() => c,
            _ = cancel.cancelled() => return 1,
        };
        let Some(chunk) = chunk else { break };
        let Ok(bytes) = chunk else { return 1 };
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(newline_idx) = buffer.find('\n') {
            let mut line = buffer[..newline_idx].to_string();
            if line.ends_with('\r') {
                line.pop();
            }
            buffer.drain(..=newline_idx);

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with(':') || trimmed.starts_with("event:") {
                continue;
            }
            let payload = trimmed.strip_prefix("data:").map(str::trim).unwrap_or(trimmed);
            if payload.is_empty() || payload == "[DONE]" {
                continue;
            }

            let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                continue;
            };
            let Some(text) = extract(&value) else { continue };
            if text.is_empty() {
                continue;
            }

            use tokio::io::AsyncWriteExt;
            let _ = log_file.write_all(text.as_bytes()).await;

            bus.emit(
                event_types::EVENT_CLI_OUTPUT,
                Some(task_id.to_string()),
                serde_json::json!({ "line": text }),
            );

            for event in parser.feed_line(parser_label, &text) {
                let _ = events_tx.send(ChildRunnerEvent::Subtask(event));
            }
        }
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_ep_hint_is_preferred_and_normalized() {
        let token = "tid=abc;exp=123;proxy-ep=proxy.example.com;other=1";
        assert_eq!(extract_proxy_ep_hint(token), Some("https://proxy.example.com".to_string()));
    }

    #[test]
    fn proxy_ep_hint_absent_returns_none() {
        assert_eq!(extract_proxy_ep_hint("tid=abc;exp=123"), None);
    }

    #[test]
    fn negative_pids_are_strictly_decreasing() {
        let a = next_negative_pid();
        let b = next_negative_pid();
        assert!(a < 0 && b < 0);
        assert_ne!(a, b);
    }
}
