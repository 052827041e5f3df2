//! Startup recovery (§1, §5, §8 invariant 9): a process restart has no
//! in-memory record of whatever was running before it died, so an
//! `in_progress` task found in the database is by definition orphaned. There
//! is no process to kill and no live worktree handle to roll back against
//! (the worktree manager's state is purely in-memory) — recovery's job is to
//! reconcile the database and free the agent so the CEO can re-run the task.

use std::sync::Arc;

use crate::bus::{event_types, EventBus};
use crate::db::queries::{self, AgentPatch, TaskFilter, TaskPatch};
use crate::db::Database;

pub async fn recover(db: &Arc<Database>, bus: &Arc<EventBus>) {
    let tasks = match queries::list_tasks(db, &TaskFilter { status: Some("in_progress".to_string()), ..Default::default() }) {
        Ok(tasks) => tasks,
        Err(err) => {
            tracing::error!(%err, "recovery: failed to list in_progress tasks");
            return;
        }
    };

    for row in tasks {
        let task_id = row.task.id.clone();
        tracing::warn!(task_id, "recovering orphaned in_progress task from a prior run");

        if let Err(err) = queries::insert_task_log(
            db,
            &task_id,
            "recovery",
            "server restarted while this task was in progress; cancelling for manual re-run",
        ) {
            tracing::error!(task_id, %err, "recovery: failed to log cancellation");
        }

        if let Err(err) = queries::update_task(
            db,
            &task_id,
            &TaskPatch { status: Some("cancelled".to_string()), ..Default::default() },
        ) {
            tracing::error!(task_id, %err, "recovery: failed to cancel task");
            continue;
        }

        if let Some(agent_id) = &row.task.assigned_agent_id {
            if let Err(err) = queries::update_agent(
                db,
                agent_id,
                &AgentPatch { status: Some("idle".to_string()), current_task_id: Some(None), ..Default::default() },
            ) {
                tracing::error!(task_id, agent_id, %err, "recovery: failed to free agent");
            } else {
                bus.emit(
                    event_types::EVENT_AGENT_STATUS,
                    None,
                    serde_json::json!({ "agentId": agent_id, "status": "idle" }),
                );
            }
        }

        bus.emit(
            event_types::EVENT_TASK_UPDATE,
            Some(task_id.clone()),
            serde_json::json!({ "taskId": task_id, "status": "cancelled" }),
        );
    }
}
