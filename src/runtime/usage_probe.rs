//! Usage Probe (§6 "CLI provider auth detection" / "CLI usage APIs"):
//! discovers each CLI provider's local credential, polls its quota API, and
//! caches the result with a 5-minute freshness margin.
//!
//! `reqwest::Client` construction and bearer-header handling follow the
//! same idiom as this crate's other HTTP clients; the keychain/file-probe
//! fan-out is written "one function per concern, propagate via thiserror"
//! to match.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::{event_types, EventBus};
use crate::db::queries::{self, CliUsageCacheRow};
use crate::db::{Database, DbError};

const FRESHNESS_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageWindow {
    pub label: String,
    pub utilization: f64,
    pub resets_at: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderUsage {
    pub provider: String,
    pub windows: Vec<UsageWindow>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AuthProbe {
    pub provider: &'static str,
    pub authenticated: bool,
    pub source: Option<String>,
}

pub struct UsageProbe {
    db: Arc<Database>,
    bus: Arc<EventBus>,
    http: reqwest::Client,
}

impl UsageProbe {
    pub fn new(db: Arc<Database>, bus: Arc<EventBus>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client build");
        Self { db, bus, http }
    }

    /// Entry point for the background polling loop and for
    /// `POST /api/cli-usage/refresh`.
    pub async fn refresh_all(&self) {
        for provider in ["claude", "codex", "gemini"] {
            if !self.is_stale(provider) {
                continue;
            }
            let usage = self.refresh_provider(provider).await;
            self.persist(&usage);
        }
    }

    fn is_stale(&self, provider: &str) -> bool {
        let Ok(rows) = queries::list_cli_usage_cache(&self.db) else { return true };
        let Some(row) = rows.iter().find(|r| r.provider == provider) else { return true };
        let Ok(refreshed) = row.refreshed_at.parse::<chrono::DateTime<chrono::Utc>>() else { return true };
        chrono::Utc::now().signed_duration_since(refreshed) > chrono::Duration::seconds(FRESHNESS_MARGIN_SECS)
    }

    fn persist(&self, usage: &ProviderUsage) {
        let row = CliUsageCacheRow {
            provider: usage.provider.clone(),
            windows_json: serde_json::to_string(&usage.windows).unwrap_or_else(|_| "[]".to_string()),
            error: usage.error.clone(),
            refreshed_at: chrono::Utc::now().to_rfc3339(),
        };
        let _ = queries::upsert_cli_usage_cache(&self.db, &row);
        self.bus.emit(
            event_types::EVENT_CLI_USAGE_UPDATE,
            None,
            serde_json::json!({ "provider": usage.provider }),
        );
    }

    async fn refresh_provider(&self, provider: &str) -> ProviderUsage {
        let result = match provider {
            "claude" => self.refresh_claude().await,
            "codex" => self.refresh_codex().await,
            "gemini" => self.refresh_gemini().await,
            _ => Err("unsupported".to_string()),
        };
        match result {
            Ok(windows) => ProviderUsage { provider: provider.to_string(), windows, error: None },
            Err(e) => ProviderUsage { provider: provider.to_string(), windows: Vec::new(), error: Some(e) },
        }
    }

    async fn refresh_claude(&self) -> Result<Vec<UsageWindow>, String> {
        let token = detect_claude_token().ok_or("unauthenticated")?;
        let resp = self
            .http
            .get("https://api.anthropic.com/api/oauth/usage")
            .bearer_auth(&token)
            .header("anthropic-beta", "oauth-2025-04-20")
            .send()
            .await
            .map_err(|_| "unavailable".to_string())?;
        if !resp.status().is_success() {
            return Err(format!("http_{}", resp.status().as_u16()));
        }
        let body: ClaudeUsageResponse = resp.json().await.map_err(|_| "unavailable".to_string())?;
        let mut windows = Vec::new();
        if let Some(w) = body.five_hour {
            windows.push(window("5-hour", w));
        }
        if let Some(w) = body.seven_day {
            windows.push(window("7-day", w));
        }
        if let Some(w) = body.seven_day_sonnet {
            windows.push(window("7-day-sonnet", w));
        }
        if let Some(w) = body.seven_day_opus {
            windows.push(window("7-day-opus", w));
        }
        Ok(windows)
    }

    async fn refresh_codex(&self) -> Result<Vec<UsageWindow>, String> {
        let (token, account_id) = detect_codex_token().ok_or("unauthenticated")?;
        let mut req = self.http.get("https://chatgpt.com/backend-api/wham/usage").bearer_auth(&token);
        if let Some(account_id) = &account_id {
            req = req.header("ChatGPT-Account-Id", account_id);
        }
        let resp = req.send().await.map_err(|_| "unavailable".to_string())?;
        if !resp.status().is_success() {
            return Err(format!("http_{}", resp.status().as_u16()));
        }
        let body: CodexUsageResponse = resp.json().await.map_err(|_| "unavailable".to_string())?;
        let mut windows = Vec::new();
        if let Some(w) = body.rate_limit.primary_window {
            windows.push(UsageWindow {
                label: "5-hour".to_string(),
                utilization: w.used_percent / 100.0,
                resets_at: w.reset_at.map(|secs| {
                    chrono::DateTime::from_timestamp(secs, 0).map(|d| d.to_rfc3339()).unwrap_or_default()
                }),
            });
        }
        if let Some(w) = body.rate_limit.secondary_window {
            windows.push(UsageWindow {
                label: "7-day".to_string(),
                utilization: w.used_percent / 100.0,
                resets_at: w.reset_at.map(|secs| {
                    chrono::DateTime::from_timestamp(secs, 0).map(|d| d.to_rfc3339()).unwrap_or_default()
                }),
            });
        }
        Ok(windows)
    }

    async fn refresh_gemini(&self) -> Result<Vec<UsageWindow>, String> {
        let token = detect_gemini_token().ok_or("unauthenticated")?;
        let project = self.discover_gemini_project(&token).await?;

        let resp = self
            .http
            .post("https://cloudcode-pa.googleapis.com/v1internal:retrieveUserQuota")
            .bearer_auth(&token)
            .json(&serde_json::json!({ "project": project }))
            .send()
            .await
            .map_err(|_| "unavailable".to_string())?;
        if !resp.status().is_success() {
            return Err(format!("http_{}", resp.status().as_u16()));
        }
        let body: serde_json::Value = resp.json().await.map_err(|_| "unavailable".to_string())?;
        let mut windows = Vec::new();
        if let Some(buckets) = body.get("buckets").and_then(|b| b.as_array()) {
            for bucket in buckets {
                let Some(name) = bucket.get("name").and_then(|n| n.as_str()) else { continue };
                if name.ends_with("_vertex") {
                    continue;
                }
                let remaining_fraction = bucket.get("remainingFraction").and_then(|f| f.as_f64()).unwrap_or(1.0);
                let utilization = ((1.0 - remaining_fraction) * 100.0).round() / 100.0;
                windows.push(UsageWindow { label: name.to_string(), utilization, resets_at: None });
            }
        }
        Ok(windows)
    }

    async fn discover_gemini_project(&self, token: &str) -> Result<String, String> {
        if let Ok(p) = std::env::var("GOOGLE_CLOUD_PROJECT") {
            return Ok(p);
        }
        let resp = self
            .http
            .post("https://cloudcode-pa.googleapis.com/v1internal:loadCodeAssist")
            .bearer_auth(token)
            .json(&serde_json::json!({
                "metadata": { "ideType": "GEMINI_CLI", "platform": "PLATFORM_UNSPECIFIED", "pluginType": "GEMINI" }
            }))
            .send()
            .await
            .map_err(|_| "unavailable".to_string())?;
        if resp.status().is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            if let Some(project) = body.get("cloudaicompanionProject").and_then(|p| p.as_str()) {
                return Ok(project.to_string());
            }
        }
        if let Some(home) = dirs_home() {
            let settings_path = home.join(".gemini").join("settings.json");
            if let Ok(contents) = std::fs::read_to_string(settings_path) {
                if let Ok(json) = serde_json::from_str::<serde_json::Value>(&contents) {
                    if let Some(project) = json.get("project").and_then(|p| p.as_str()) {
                        return Ok(project.to_string());
                    }
                }
            }
        }
        Err("unavailable".to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ClaudeUsageResponse {
    five_hour: Option<ClaudeUsageWindow>,
    seven_day: Option<ClaudeUsageWindow>,
    seven_day_sonnet: Option<ClaudeUsageWindow>,
    seven_day_opus: Option<ClaudeUsageWindow>,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsageWindow {
    utilization: f64,
    resets_at: Option<String>,
}

fn window(label: &str, w: ClaudeUsageWindow) -> UsageWindow {
    UsageWindow { label: label.to_string(), utilization: (w.utilization.round()) / 100.0, resets_at: w.resets_at }
}

#[derive(Debug, Deserialize)]
struct CodexUsageResponse {
    rate_limit: CodexRateLimit,
}

#[derive(Debug, Deserialize)]
struct CodexRateLimit {
    primary_window: Option<CodexWindow>,
    secondary_window: Option<CodexWindow>,
}

#[derive(Debug, Deserialize)]
struct CodexWindow {
    used_percent: f64,
    reset_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// CLI auth detection (§6 "CLI provider auth detection")
// ---------------------------------------------------------------------------

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

pub fn probe_cli_auth(provider: &str) -> AuthProbe {
    let (authenticated, source) = match provider {
        "claude" => detect_claude_token()
            .map(|_| (true, Some("file".to_string())))
            .unwrap_or((false, None)),
        "codex" => detect_codex_token()
            .map(|_| (true, Some("file".to_string())))
            .unwrap_or((false, None)),
        "gemini" => detect_gemini_token()
            .map(|_| (true, Some("file".to_string())))
            .unwrap_or((false, None)),
        "opencode" => detect_opencode_token()
            .map(|_| (true, Some("file".to_string())))
            .unwrap_or((false, None)),
        _ => (false, None),
    };
    AuthProbe { provider: provider_static_name(provider), authenticated, source }
}

fn provider_static_name(provider: &str) -> &'static str {
    match provider {
        "claude" => "claude",
        "codex" => "codex",
        "gemini" => "gemini",
        "opencode" => "opencode",
        _ => "unknown",
    }
}

fn detect_claude_token() -> Option<String> {
    let home = dirs_home()?;

    if let Ok(contents) = std::fs::read_to_string(home.join(".claude.json")) {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(&contents) {
            if json.get("oauthAccount").is_some() {
                if let Some(token) = json
                    .get("oauthAccount")
                    .and_then(|a| a.get("accessToken"))
                    .and_then(|t| t.as_str())
                {
                    return Some(token.to_string());
                }
                return Some("present".to_string());
            }
        }
    }

    if let Ok(contents) = std::fs::read_to_string(home.join(".claude").join("auth.json")) {
        if !contents.trim().is_empty() {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&contents) {
                if let Some(token) = json.get("accessToken").and_then(|t| t.as_str()) {
                    return Some(token.to_string());
                }
            }
            return Some("present".to_string());
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(secret) = macos_keychain_password("Claude Code-credentials", None) {
            return Some(secret);
        }
    }

    None
}

fn detect_codex_token() -> Option<(String, Option<String>)> {
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if !key.is_empty() {
            return Some((key, None));
        }
    }
    let home = dirs_home()?;
    let contents = std::fs::read_to_string(home.join(".codex").join("auth.json")).ok()?;
    let json: serde_json::Value = serde_json::from_str(&contents).ok()?;
    if let Some(key) = json.get("OPENAI_API_KEY").and_then(|v| v.as_str()) {
        return Some((key.to_string(), None));
    }
    let tokens = json.get("tokens")?;
    let access_token = tokens.get("access_token").and_then(|v| v.as_str())?.to_string();
    let account_id = tokens.get("account_id").and_then(|v| v.as_str()).map(|s| s.to_string());
    Some((access_token, account_id))
}

fn detect_gemini_token() -> Option<String> {
    #[cfg(target_os = "macos")]
    {
        if let Some(secret) = macos_keychain_password("gemini-cli-oauth", Some("main-account")) {
            return Some(secret);
        }
    }

    let home = dirs_home();
    if let Some(home) = &home {
        if let Ok(contents) = std::fs::read_to_string(home.join(".gemini").join("oauth_creds.json")) {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&contents) {
                if let Some(token) = json.get("access_token").and_then(|v| v.as_str()) {
                    return Some(token.to_string());
                }
            }
        }
    }

    if let Ok(appdata) = std::env::var("APPDATA") {
        let path = PathBuf::from(appdata).join("gcloud").join("application_default_credentials.json");
        if let Ok(contents) = std::fs::read_to_string(path) {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&contents) {
                if let Some(token) = json.get("access_token").and_then(|v| v.as_str()) {
                    return Some(token.to_string());
                }
            }
        }
    }
    None
}

fn detect_opencode_token() -> Option<String> {
    let candidates: Vec<PathBuf> = {
        let mut c = Vec::new();
        if let Some(home) = dirs_home() {
            c.push(home.join(".local").join("share").join("opencode").join("auth.json"));
            c.push(home.join("Library").join("Application Support").join("opencode").join("auth.json"));
        }
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            c.push(PathBuf::from(xdg).join("opencode").join("auth.json"));
        }
        c
    };
    for path in candidates {
        if let Ok(contents) = std::fs::read_to_string(&path) {
            if !contents.trim().is_empty() {
                return Some("present".to_string());
            }
        }
    }
    None
}

#[cfg(target_os = "macos")]
fn macos_keychain_password(service: &str, account: Option<&str>) -> Option<String> {
    let mut cmd = std::process::Command::new("security");
    cmd.arg("find-generic-password").arg("-s").arg(service).arg("-w");
    if let Some(account) = account {
        cmd.arg("-a").arg(account);
    }
    let output = cmd.output().ok()?;
    if !output.status.success() {
        return None;
    }
    let secret = String::from_utf8(output.stdout).ok()?.trim().to_string();
    if secret.is_empty() {
        None
    } else {
        Some(secret)
    }
}

/// Persists a provider's access token back to the Store, matching §6's
/// "refreshed access tokens are written back to the Store with new
/// `expires_at`" rule for tokens sourced from the web-oauth flow (Copilot,
/// Antigravity) rather than a CLI auth file.
pub fn persist_refreshed_token(
    db: &Database,
    provider: &str,
    access_token: &str,
    refresh_token: Option<&str>,
    expires_at: &str,
) -> Result<(), DbError> {
    let existing = queries::get_oauth_credential(db, provider)?;
    queries::upsert_oauth_credential(
        db,
        &queries::OAuthCredentialRow {
            provider: provider.to_string(),
            source: existing.as_ref().map(|e| e.source.clone()).unwrap_or_else(|| "web-oauth".to_string()),
            email: existing.as_ref().and_then(|e| e.email.clone()),
            scope: existing.as_ref().and_then(|e| e.scope.clone()),
            expires_at: Some(expires_at.to_string()),
            encrypted_data: existing.as_ref().and_then(|e| e.encrypted_data.clone()),
            access_token: Some(access_token.to_string()),
            refresh_token: refresh_token
                .map(|s| s.to_string())
                .or_else(|| existing.as_ref().and_then(|e| e.refresh_token.clone())),
            updated_at: chrono::Utc::now().to_rfc3339(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_window_converts_percent_to_fraction() {
        let w = window("5-hour", ClaudeUsageWindow { utilization: 42.0, resets_at: None });
        assert_eq!(w.utilization, 0.42);
    }

    #[test]
    fn probe_cli_auth_reports_unauthenticated_for_unknown_provider() {
        let probe = probe_cli_auth("copilot");
        assert!(!probe.authenticated);
    }
}
