use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::db::queries::{self, AgentPatch};
use crate::error::AppError;

use super::AppState;

pub async fn list_agents(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let agents = queries::list_agents(&state.db)?;
    Ok(Json(serde_json::json!({ "agents": agents })))
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateAgentBody {
    pub name: Option<String>,
    pub name_ko: Option<String>,
    pub department_id: Option<Option<String>>,
    pub role: Option<String>,
    pub cli_provider: Option<Option<String>>,
    pub avatar_emoji: Option<Option<String>>,
    pub personality: Option<Option<String>>,
    pub status: Option<String>,
    pub current_task_id: Option<Option<String>>,
}

pub async fn update_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateAgentBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let patch = AgentPatch {
        name: body.name,
        name_ko: body.name_ko,
        department_id: body.department_id,
        role: body.role,
        cli_provider: body.cli_provider,
        avatar_emoji: body.avatar_emoji,
        personality: body.personality,
        status: body.status,
        current_task_id: body.current_task_id,
    };
    queries::update_agent(&state.db, &id, &patch)?;
    let agent = queries::get_agent(&state.db, &id)?.ok_or_else(|| AppError::NotFound(format!("agent {id}")))?;
    Ok(Json(serde_json::json!({ "agent": agent })))
}
