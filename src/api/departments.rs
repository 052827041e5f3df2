use axum::extract::State;
use axum::Json;

use crate::db::queries;
use crate::error::AppError;

use super::AppState;

pub async fn list_departments(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let departments = queries::list_departments(&state.db)?;
    Ok(Json(serde_json::json!({ "departments": departments })))
}
