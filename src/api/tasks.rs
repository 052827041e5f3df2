use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::bus::event_types;
use crate::db::queries::{self, MessageRow, TaskFilter, TaskPatch};
use crate::error::AppError;
use crate::runtime::orchestrator::StopMode;
use crate::runtime::pretty_print::pretty_print;

use super::AppState;

const SUPPORTED_PROVIDERS: &[&str] = &["claude", "codex", "gemini", "opencode", "copilot", "antigravity"];

#[derive(Debug, Deserialize, Default)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub department_id: Option<String>,
    pub agent_id: Option<String>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(q): Query<ListTasksQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let filter = TaskFilter { status: q.status, department_id: q.department_id, agent_id: q.agent_id };
    let tasks = queries::list_tasks(&state.db, &filter)?;
    Ok(Json(serde_json::json!({ "tasks": tasks })))
}

pub async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, AppError> {
    let task = queries::get_task(&state.db, &id)?.ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
    Ok(Json(serde_json::json!({ "task": task })))
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    pub title: String,
    pub description: Option<String>,
    pub department_id: Option<String>,
    pub priority: Option<i64>,
    pub task_type: Option<String>,
    pub project_path: Option<String>,
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.title.trim().is_empty() {
        return Err(AppError::InvalidInput("title is required".to_string()));
    }
    let now = chrono::Utc::now().to_rfc3339();
    let task = queries::TaskRow {
        id: uuid::Uuid::new_v4().to_string(),
        title: body.title,
        description: body.description,
        department_id: body.department_id,
        assigned_agent_id: None,
        status: "inbox".to_string(),
        priority: body.priority.unwrap_or(0),
        task_type: body.task_type,
        project_path: body.project_path,
        result: None,
        started_at: None,
        completed_at: None,
        created_at: now.clone(),
        updated_at: now,
    };
    queries::insert_task(&state.db, &task)?;
    state.bus.emit(event_types::EVENT_TASK_UPDATE, Some(task.id.clone()), serde_json::json!({ "taskId": task.id, "status": "inbox" }));
    Ok(Json(serde_json::json!({ "id": task.id, "task": task })))
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateTaskBody {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub department_id: Option<Option<String>>,
    pub assigned_agent_id: Option<Option<String>>,
    pub status: Option<String>,
    pub priority: Option<i64>,
    pub task_type: Option<Option<String>>,
    pub project_path: Option<Option<String>>,
    pub result: Option<Option<String>>,
}

pub async fn update_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateTaskBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let patch = TaskPatch {
        title: body.title,
        description: body.description,
        department_id: body.department_id,
        assigned_agent_id: body.assigned_agent_id,
        status: body.status.clone(),
        priority: body.priority,
        task_type: body.task_type,
        project_path: body.project_path,
        result: body.result,
    };
    queries::update_task(&state.db, &id, &patch)?;
    if let Some(status) = &body.status {
        state.bus.emit(event_types::EVENT_TASK_UPDATE, Some(id.clone()), serde_json::json!({ "taskId": id, "status": status }));
    }
    let task = queries::get_task(&state.db, &id)?.ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
    Ok(Json(serde_json::json!({ "task": task })))
}

/// `DELETE /api/tasks/:id`: kills the process if running, frees the agent,
/// removes logs+messages (task_logs/subtasks/messages cascade or are
/// explicitly cleared by `queries::delete_task`).
pub async fn delete_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, AppError> {
    let task = queries::get_task(&state.db, &id)?.ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
    if task.status == "in_progress" {
        state.orchestrator.stop_task(&id, StopMode::Cancel).await?;
    }
    queries::delete_task(&state.db, &id)?;
    state.bus.emit(event_types::EVENT_TASK_UPDATE, Some(id.clone()), serde_json::json!({ "taskId": id, "status": "deleted" }));
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct AssignTaskBody {
    pub agent_id: String,
}

pub async fn assign_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AssignTaskBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let task = queries::get_task(&state.db, &id)?.ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
    let agent = queries::get_agent(&state.db, &body.agent_id)?
        .ok_or_else(|| AppError::NotFound(format!("agent {}", body.agent_id)))?;

    queries::update_task(
        &state.db,
        &id,
        &TaskPatch {
            assigned_agent_id: Some(Some(body.agent_id.clone())),
            status: Some("planned".to_string()),
            ..Default::default()
        },
    )?;

    queries::insert_message(
        &state.db,
        &MessageRow {
            id: uuid::Uuid::new_v4().to_string(),
            sender_type: "ceo".to_string(),
            sender_id: None,
            receiver_type: "agent".to_string(),
            receiver_id: Some(agent.id.clone()),
            content: format!("You've been assigned: \"{}\"", task.title),
            message_type: "task_assign".to_string(),
            task_id: Some(id.clone()),
            created_at: chrono::Utc::now().to_rfc3339(),
        },
    )?;
    state.bus.emit(event_types::EVENT_NEW_MESSAGE, Some(id.clone()), serde_json::json!({ "taskId": id }));
    state.bus.emit(event_types::EVENT_TASK_UPDATE, Some(id.clone()), serde_json::json!({ "taskId": id, "status": "planned" }));

    let task = queries::get_task(&state.db, &id)?.ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
    Ok(Json(serde_json::json!({ "task": task })))
}

#[derive(Debug, Deserialize, Default)]
pub struct RunTaskBody {
    pub agent_id: Option<String>,
    pub project_path: Option<String>,
}

pub async fn run_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RunTaskBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut task = queries::get_task(&state.db, &id)?.ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
    if task.status == "in_progress" {
        return Err(AppError::InvalidInput("already_running".to_string()));
    }

    if let Some(project_path) = &body.project_path {
        queries::update_task(&state.db, &id, &TaskPatch { project_path: Some(Some(project_path.clone())), ..Default::default() })?;
    }

    let agent_id = body.agent_id.clone().or_else(|| task.assigned_agent_id.clone());
    let Some(agent_id) = agent_id else {
        return Err(AppError::InvalidInput("task has no assigned agent".to_string()));
    };
    let agent = queries::get_agent(&state.db, &agent_id)?.ok_or_else(|| AppError::NotFound(format!("agent {agent_id}")))?;
    if agent.status == "working" {
        return Err(AppError::InvalidInput("agent_busy".to_string()));
    }
    let provider = agent.cli_provider.as_deref().unwrap_or("claude");
    if !SUPPORTED_PROVIDERS.contains(&provider) {
        return Err(AppError::InvalidInput("unsupported_provider".to_string()));
    }

    if task.assigned_agent_id.as_deref() != Some(agent_id.as_str()) {
        queries::update_task(&state.db, &id, &TaskPatch { assigned_agent_id: Some(Some(agent_id.clone())), ..Default::default() })?;
    }
    task = queries::get_task(&state.db, &id)?.ok_or_else(|| AppError::NotFound(format!("task {id}")))?;

    let orchestrator = state.orchestrator.clone();
    let run_id = id.clone();
    tokio::spawn(async move { orchestrator.run_task(&run_id).await });

    Ok(Json(serde_json::json!({ "task": task })))
}

#[derive(Debug, Deserialize)]
pub struct StopTaskBody {
    pub mode: String,
}

pub async fn stop_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StopTaskBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mode = match body.mode.as_str() {
        "pause" => StopMode::Pause,
        "cancel" => StopMode::Cancel,
        other => return Err(AppError::InvalidInput(format!("unknown stop mode: {other}"))),
    };
    state.orchestrator.stop_task(&id, mode).await?;
    let task = queries::get_task(&state.db, &id)?.ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
    Ok(Json(serde_json::json!({ "task": task })))
}

pub async fn resume_task(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, AppError> {
    state.orchestrator.resume_task(&id).await?;
    let task = queries::get_task(&state.db, &id)?.ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
    Ok(Json(serde_json::json!({ "task": task })))
}

#[derive(Debug, Deserialize, Default)]
pub struct TerminalQuery {
    pub lines: Option<usize>,
    pub pretty: Option<u8>,
}

pub async fn terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<TerminalQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let log_path = state.config.logs_dir.join(format!("{id}.log"));
    let contents = std::fs::read_to_string(&log_path).unwrap_or_default();
    let tail_lines = q.lines.unwrap_or(200);
    let tailed: String = contents.lines().rev().take(tail_lines).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n");
    let output = if q.pretty.unwrap_or(0) == 1 { pretty_print(&tailed) } else { tailed };
    Ok(Json(serde_json::json!({ "taskId": id, "output": output })))
}

pub async fn diff(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, AppError> {
    let summary = state.orchestrator.worktree_diff_summary(&id);
    Ok(Json(serde_json::json!({ "taskId": id, "diff": summary })))
}

pub async fn merge(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, AppError> {
    let result = state.orchestrator.merge_task_worktree(&id)?;
    Ok(Json(serde_json::json!({ "taskId": id, "result": result })))
}

pub async fn discard(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, AppError> {
    let summary = state.orchestrator.discard_task_worktree(&id);
    Ok(Json(serde_json::json!({ "taskId": id, "discarded": summary })))
}

pub async fn meeting_minutes(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<serde_json::Value>, AppError> {
    let minutes = queries::list_meetings_for_task(&state.db, &id)?;
    Ok(Json(serde_json::json!({ "minutes": minutes })))
}
