//! HTTP/WebSocket surface (§6): one `AppState` built once, a flat handler
//! module per REST resource, `State<AppState>` extractors, and JSON
//! request/response structs per route.

mod agents;
mod cli;
mod departments;
mod health;
mod messages;
mod oauth;
mod settings;
mod tasks;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::bus::EventBus;
use crate::config::Config;
use crate::db::Database;
use crate::runtime::oauth::OAuthService;
use crate::runtime::orchestrator::Orchestrator;
use crate::runtime::usage_probe::{AuthProbe, UsageProbe};

/// 30s-cached CLI auth-probe result (§6 "CLI provider auth detection").
pub struct CliStatusCache {
    pub entries: Vec<AuthProbe>,
    pub refreshed_at: Instant,
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub bus: Arc<EventBus>,
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
    pub oauth: Arc<OAuthService>,
    pub usage_probe: Arc<UsageProbe>,
    pub cli_status_cache: Arc<Mutex<Option<CliStatusCache>>>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/health", get(health::health))
        .route("/health", get(health::health))
        .route("/healthz", get(health::health))
        .route("/ws", get(ws_upgrade))
        .route("/api/departments", get(departments::list_departments))
        .route("/api/agents", get(agents::list_agents))
        .route("/api/agents/{id}", patch(agents::update_agent))
        .route("/api/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route("/api/tasks/{id}", patch(tasks::update_task).delete(tasks::delete_task).get(tasks::get_task))
        .route("/api/tasks/{id}/assign", post(tasks::assign_task))
        .route("/api/tasks/{id}/run", post(tasks::run_task))
        .route("/api/tasks/{id}/stop", post(tasks::stop_task))
        .route("/api/tasks/{id}/resume", post(tasks::resume_task))
        .route("/api/tasks/{id}/terminal", get(tasks::terminal))
        .route("/api/tasks/{id}/diff", get(tasks::diff))
        .route("/api/tasks/{id}/merge", post(tasks::merge))
        .route("/api/tasks/{id}/discard", post(tasks::discard))
        .route("/api/tasks/{id}/meeting-minutes", get(tasks::meeting_minutes))
        .route("/api/messages", get(messages::list_messages).post(messages::post_message).delete(messages::delete_messages))
        .route("/api/announcements", post(messages::post_announcement))
        .route("/api/cli-status", get(cli::cli_status))
        .route("/api/cli-usage", get(cli::cli_usage))
        .route("/api/cli-usage/refresh", post(cli::cli_usage_refresh))
        .route("/api/settings", get(settings::get_settings).put(settings::put_settings))
        .route("/api/oauth/status", get(oauth::status))
        .route("/api/oauth/start", get(oauth::start))
        .route("/api/oauth/callback/antigravity", get(oauth::callback_antigravity))
        .route("/api/oauth/disconnect", post(oauth::disconnect))
        .route("/api/oauth/github-copilot/device-start", post(oauth::device_start))
        .route("/api/oauth/github-copilot/device-poll", post(oauth::device_poll))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| crate::bus::ws::handle_socket(socket, state.bus))
}
