use axum::extract::{Query, State};
use axum::Json;
use rand::Rng;
use serde::Deserialize;

use crate::bus::event_types;
use crate::core::department::DEPARTMENTS;
use crate::db::queries::{self, MessageFilter, MessageRow};
use crate::error::AppError;
use crate::runtime::delegation::scan_mentions;

use super::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct ListMessagesQuery {
    pub receiver_type: Option<String>,
    pub receiver_id: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let filter = MessageFilter { receiver_type: q.receiver_type, receiver_id: q.receiver_id, limit: q.limit };
    let messages = queries::list_messages(&state.db, &filter)?;
    Ok(Json(serde_json::json!({ "messages": messages })))
}

#[derive(Debug, Deserialize)]
pub struct PostMessageBody {
    pub receiver_type: String,
    pub receiver_id: Option<String>,
    pub content: String,
    pub message_type: Option<String>,
    pub task_id: Option<String>,
}

async fn insert_and_broadcast(state: &AppState, body: PostMessageBody, sender_type: &str) -> Result<MessageRow, AppError> {
    if body.content.trim().is_empty() {
        return Err(AppError::InvalidInput("content is required".to_string()));
    }
    let row = MessageRow {
        id: uuid::Uuid::new_v4().to_string(),
        sender_type: sender_type.to_string(),
        sender_id: None,
        receiver_type: body.receiver_type,
        receiver_id: body.receiver_id,
        content: body.content,
        message_type: body.message_type.unwrap_or_else(|| "chat".to_string()),
        task_id: body.task_id,
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    queries::insert_message(&state.db, &row)?;
    Ok(row)
}

/// `POST /api/messages` (§6): CEO→agent or CEO→department chat message.
pub async fn post_message(
    State(state): State<AppState>,
    Json(body): Json<PostMessageBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let row = insert_and_broadcast(&state, body, "ceo").await?;
    state.bus.emit(event_types::EVENT_NEW_MESSAGE, row.task_id.clone(), serde_json::json!({ "messageId": row.id }));

    if row.receiver_type == "agent" {
        if let Some(agent_id) = &row.receiver_id {
            if let Some(agent) = queries::get_agent(&state.db, agent_id)? {
                state.orchestrator.dispatch_ceo_message(&agent, &row.message_type, &row.content).await?;
            }
        }
    }

    Ok(Json(serde_json::json!({ "message": row })))
}

#[derive(Debug, Deserialize, Default)]
pub struct DeleteMessagesQuery {
    pub agent_id: Option<String>,
}

pub async fn delete_messages(
    State(state): State<AppState>,
    Query(q): Query<DeleteMessagesQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let deleted = queries::delete_messages(&state.db, q.agent_id.as_deref())?;
    state.bus.emit(event_types::EVENT_MESSAGES_CLEARED, None, serde_json::json!({ "agentId": q.agent_id }));
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
pub struct AnnouncementBody {
    pub content: String,
}

/// `POST /api/announcements` (§4.9, §6): broadcast to `all`, then each
/// active team leader acknowledges on its own 1.5-3s jitter, and — if the
/// content `@mentions` anyone — a full delegation follows 5-7s later.
pub async fn post_announcement(
    State(state): State<AppState>,
    Json(body): Json<AnnouncementBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let row = insert_and_broadcast(
        &state,
        PostMessageBody {
            receiver_type: "all".to_string(),
            receiver_id: None,
            content: body.content.clone(),
            message_type: Some("announcement".to_string()),
            task_id: None,
        },
        "ceo",
    )
    .await?;
    state.bus.emit(event_types::EVENT_ANNOUNCEMENT, None, serde_json::json!({ "messageId": row.id }));

    for dept in DEPARTMENTS {
        let Some(leader) = queries::get_department_leader(&state.db, dept.id)? else { continue };
        if leader.status == "offline" {
            continue;
        }
        let db = state.db.clone();
        let bus = state.bus.clone();
        let leader_id = leader.id.clone();
        let dept_id = dept.id.to_string();
        tokio::spawn(async move {
            let delay_ms = rand::thread_rng().gen_range(1500..=3000);
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            let ack = MessageRow {
                id: uuid::Uuid::new_v4().to_string(),
                sender_type: "agent".to_string(),
                sender_id: Some(leader_id.clone()),
                receiver_type: "ceo".to_string(),
                receiver_id: None,
                content: format!("Acknowledged, on it for {dept_id}."),
                message_type: "chat".to_string(),
                task_id: None,
                created_at: chrono::Utc::now().to_rfc3339(),
            };
            if queries::insert_message(&db, &ack).is_ok() {
                bus.emit(event_types::EVENT_NEW_MESSAGE, None, serde_json::json!({ "messageId": ack.id, "senderId": leader_id }));
            }
        });
    }

    let mentions = scan_mentions(&body.content);
    if !mentions.is_empty() {
        let orchestrator = state.orchestrator.clone();
        let db = state.db.clone();
        let content = body.content.clone();
        tokio::spawn(async move {
            let delay_ms = rand::thread_rng().gen_range(5000..=7000);
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            for mention in mentions {
                if let Ok(Some(agent)) = queries::get_agent(&db, &mention) {
                    let _ = orchestrator.dispatch_ceo_message(&agent, "announcement", &content).await;
                }
            }
        });
    }

    Ok(Json(serde_json::json!({ "message": row })))
}
