use axum::extract::{Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::Deserialize;

use crate::error::AppError;
use crate::runtime::oauth::OAuthError;

use super::AppState;

pub async fn status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let entries = state.oauth.status()?;
    Ok(Json(serde_json::json!({ "providers": entries })))
}

#[derive(Debug, Deserialize)]
pub struct StartQuery {
    pub provider: String,
    pub redirect_to: Option<String>,
}

/// `GET /api/oauth/start?provider=&redirect_to=` (§4.13): the
/// authorization-code+PKCE flow, currently Antigravity only — GitHub
/// Copilot uses the device-code pair below instead.
pub async fn start(State(state): State<AppState>, Query(q): Query<StartQuery>) -> Result<Response, AppError> {
    match q.provider.as_str() {
        "antigravity" => {
            let url = state.oauth.google_authorize_url(q.redirect_to.as_deref())?;
            Ok(Redirect::temporary(&url).into_response())
        }
        other => Err(AppError::InvalidInput(format!(
            "provider {other} has no redirect-based start; use the device-code endpoints"
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub state: String,
    pub code: String,
}

pub async fn callback_antigravity(State(state): State<AppState>, Query(q): Query<CallbackQuery>) -> Result<Response, AppError> {
    let redirect_to = state.oauth.google_callback(&q.state, &q.code).await?;
    Ok(Redirect::temporary(redirect_to.as_deref().unwrap_or("/")).into_response())
}

#[derive(Debug, Deserialize)]
pub struct DisconnectBody {
    pub provider: String,
}

pub async fn disconnect(State(state): State<AppState>, Json(body): Json<DisconnectBody>) -> Result<Json<serde_json::Value>, AppError> {
    state.oauth.disconnect(&body.provider)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub async fn device_start(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let result = state.oauth.github_device_start().await?;
    Ok(Json(serde_json::to_value(result).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
pub struct DevicePollBody {
    pub state_id: String,
}

pub async fn device_poll(State(state): State<AppState>, Json(body): Json<DevicePollBody>) -> Result<Json<serde_json::Value>, AppError> {
    match state.oauth.github_device_poll(&body.state_id).await {
        Ok(()) => Ok(Json(serde_json::json!({ "status": "connected" }))),
        Err(OAuthError::AuthorizationPending) => Ok(Json(serde_json::json!({ "status": "pending" }))),
        Err(OAuthError::SlowDown) => Ok(Json(serde_json::json!({ "status": "slow_down" }))),
        Err(err) => Err(AppError::from(err)),
    }
}
