use std::collections::HashMap;

use axum::extract::State;
use axum::Json;

use crate::db::queries;
use crate::error::AppError;

use super::AppState;

pub async fn get_settings(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let rows = queries::list_settings(&state.db)?;
    let map: HashMap<String, String> = rows.into_iter().map(|r| (r.key, r.value)).collect();
    Ok(Json(serde_json::json!({ "settings": map })))
}

/// `PUT /api/settings` (§6): upserts each key. Values that aren't already
/// plain strings are JSON-encoded before storage, since every setting is
/// stored as a TEXT column.
pub async fn put_settings(
    State(state): State<AppState>,
    Json(body): Json<HashMap<String, serde_json::Value>>,
) -> Result<Json<serde_json::Value>, AppError> {
    for (key, value) in &body {
        let stored = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        queries::set_setting(&state.db, key, &stored)?;
    }
    let rows = queries::list_settings(&state.db)?;
    let map: HashMap<String, String> = rows.into_iter().map(|r| (r.key, r.value)).collect();
    Ok(Json(serde_json::json!({ "settings": map })))
}
