use axum::extract::State;
use axum::Json;

use super::AppState;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "app": "climpire",
        "dbPath": state.config.db_path.display().to_string(),
    }))
}
