//! Unified application error type and its HTTP mapping (§7).
//!
//! Every fallible path in the crate converges on `AppError` so REST handlers
//! map to a status code in one place instead of constructing
//! `(StatusCode, Json)` pairs at each call site.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::db::DbError;
use crate::runtime::worktree::WorktreeError;
use crate::vault::VaultError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Missing field, unknown provider, already-running task, agent busy,
    /// invalid resume status, and similar caller mistakes.
    #[error("{0}")]
    InvalidInput(String),

    /// Task/agent/department/subtask id unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// CLI non-zero exit, spawn error, HTTP agent abort.
    #[error("run failed: {0}")]
    RunFailed(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    OAuth(#[from] crate::runtime::oauth::OAuthError),
}

impl AppError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::RunFailed(_) => (StatusCode::CONFLICT, "run_failed"),
            AppError::Db(DbError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::Db(_) => (StatusCode::INTERNAL_SERVER_ERROR, "db_error"),
            AppError::Worktree(_) => (StatusCode::INTERNAL_SERVER_ERROR, "worktree_error"),
            AppError::Vault(_) => (StatusCode::INTERNAL_SERVER_ERROR, "vault_error"),
            AppError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
            AppError::OAuth(crate::runtime::oauth::OAuthError::StateExpired) => {
                (StatusCode::BAD_REQUEST, "oauth_state_expired")
            }
            AppError::OAuth(crate::runtime::oauth::OAuthError::AuthorizationPending) => {
                (StatusCode::ACCEPTED, "oauth_authorization_pending")
            }
            AppError::OAuth(crate::runtime::oauth::OAuthError::SlowDown) => {
                (StatusCode::TOO_MANY_REQUESTS, "oauth_slow_down")
            }
            AppError::OAuth(crate::runtime::oauth::OAuthError::Denied(_)) => {
                (StatusCode::BAD_GATEWAY, "oauth_denied")
            }
            AppError::OAuth(_) => (StatusCode::INTERNAL_SERVER_ERROR, "oauth_error"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if status.is_server_error() {
            tracing::error!(error = %self, kind, "request failed");
        } else {
            tracing::warn!(error = %self, kind, "request rejected");
        }
        let body = Json(json!({ "error": kind, "message": self.to_string() }));
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
