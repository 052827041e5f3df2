use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::db::queries;
use crate::error::AppError;
use crate::runtime::usage_probe::probe_cli_auth;

use super::{AppState, CliStatusCache};

const CLI_STATUS_PROVIDERS: &[&str] = &["claude", "codex", "gemini", "opencode"];
const CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize, Default)]
pub struct CliStatusQuery {
    pub refresh: Option<u8>,
}

/// `GET /api/cli-status?refresh=0|1` (§6): 30s-cached CLI auth detection so
/// a tight UI poll loop doesn't hit the filesystem every time.
pub async fn cli_status(
    State(state): State<AppState>,
    Query(q): Query<CliStatusQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let force_refresh = q.refresh.unwrap_or(0) == 1;
    {
        let cache = state.cli_status_cache.lock().expect("cli status cache mutex poisoned");
        if !force_refresh {
            if let Some(cached) = cache.as_ref() {
                if cached.refreshed_at.elapsed() < CACHE_TTL {
                    return Ok(Json(serde_json::json!({ "providers": cached.entries })));
                }
            }
        }
    }

    let entries: Vec<_> = CLI_STATUS_PROVIDERS.iter().map(|p| probe_cli_auth(p)).collect();
    let mut cache = state.cli_status_cache.lock().expect("cli status cache mutex poisoned");
    *cache = Some(CliStatusCache { entries: entries.clone(), refreshed_at: Instant::now() });
    Ok(Json(serde_json::json!({ "providers": entries })))
}

pub async fn cli_usage(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let rows = queries::list_cli_usage_cache(&state.db)?;
    Ok(Json(serde_json::json!({ "usage": rows })))
}

pub async fn cli_usage_refresh(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    state.usage_probe.refresh_all().await;
    let rows = queries::list_cli_usage_cache(&state.db)?;
    Ok(Json(serde_json::json!({ "usage": rows })))
}
