//! The run loop (§4.8), completion handler (§4.10), and review sequencing
//! for a single task. Grounded on `child_runner.rs`/`http_agent_runner.rs`
//! for how a run is dispatched and read back, and on `meeting.rs` for how a
//! review-consensus round is driven once the worktree diff is in hand.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bus::event_types;
use crate::core::department::scan_mentioned_departments;
use crate::core::locale::resolve_locale;
use crate::db::queries::{self, AgentPatch, AgentRow, MessageRow, TaskPatch, TaskRow};
use crate::error::AppError;
use crate::runtime::child_runner::ChildRunnerEvent;
use crate::runtime::meeting::MeetingKind;
use crate::runtime::pretty_print::pretty_print;
use crate::runtime::stream_parser::SubtaskEvent;
use crate::runtime::worktree::MergeStrategy;

use super::Orchestrator;

const PROGRESS_TICK: std::time::Duration = std::time::Duration::from_secs(300);
const HTTP_PROVIDERS: &[&str] = &["copilot", "antigravity"];

impl Orchestrator {
    /// Entry point used by `TaskStarter` and by `resume_task`/the REST
    /// `assign`/`run` handlers. Never returns an error to the caller — a
    /// failure to even start moves the task back to `inbox` and is logged.
    pub async fn run_task(self: &Arc<Self>, task_id: &str) {
        if let Err(err) = self.run_task_inner(task_id).await {
            tracing::error!(task_id, %err, "failed to start task");
            let _ = queries::insert_task_log(&self.db, task_id, "error", &format!("failed to start: {err}"));
            let _ = queries::update_task(
                &self.db,
                task_id,
                &TaskPatch { status: Some("inbox".to_string()), ..Default::default() },
            );
        }
    }

    async fn run_task_inner(self: &Arc<Self>, task_id: &str) -> Result<(), AppError> {
        let task = queries::get_task(&self.db, task_id)?.ok_or_else(|| AppError::NotFound(task_id.to_string()))?;
        let Some(agent_id) = task.assigned_agent_id.clone() else {
            return Err(AppError::InvalidInput("task has no assigned agent".to_string()));
        };
        let agent = queries::get_agent(&self.db, &agent_id)?.ok_or_else(|| AppError::NotFound(agent_id.clone()))?;

        // 1. Resolve project path.
        let project_dir = self.resolve_project_path(&task);

        // 2. Attempt worktree creation; record outcome.
        let run_dir = match self.worktrees.create_worktree(&project_dir, task_id) {
            Ok(Some(info)) => {
                let _ = queries::insert_task_log(
                    &self.db,
                    task_id,
                    "worktree",
                    &format!("created worktree at {}", info.path.display()),
                );
                info.path
            }
            Ok(None) => {
                let _ = queries::insert_task_log(
                    &self.db,
                    task_id,
                    "worktree",
                    "project is not under git; running in place",
                );
                project_dir.clone()
            }
            Err(err) => {
                let _ = queries::insert_task_log(
                    &self.db,
                    task_id,
                    "worktree",
                    &format!("worktree creation failed, running in place: {err}"),
                );
                project_dir.clone()
            }
        };

        // 3. Compose the execution prompt.
        let prompt = self.compose_execution_prompt(&task, &agent)?;

        // 4. Flip task/agent state, broadcast.
        queries::update_task(
            &self.db,
            task_id,
            &TaskPatch { status: Some("in_progress".to_string()), ..Default::default() },
        )?;
        queries::update_agent(
            &self.db,
            &agent.id,
            &AgentPatch {
                status: Some("working".to_string()),
                current_task_id: Some(Some(task_id.to_string())),
                ..Default::default()
            },
        )?;
        self.bus.emit(
            event_types::EVENT_TASK_UPDATE,
            Some(task_id.to_string()),
            serde_json::json!({ "taskId": task_id, "status": "in_progress" }),
        );
        self.bus.emit(
            event_types::EVENT_AGENT_STATUS,
            None,
            serde_json::json!({ "agentId": agent.id, "status": "working", "taskId": task_id }),
        );

        // 5. Progress timer.
        self.spawn_progress_timer(task_id.to_string(), agent.clone());

        // 6. Start the appropriate runner.
        let provider = agent.cli_provider.clone().unwrap_or_else(|| "claude".to_string());
        let (model, reasoning_effort) = self.resolve_model_settings(&provider)?;
        let (tx, rx) = mpsc::unbounded_channel::<ChildRunnerEvent>();

        if HTTP_PROVIDERS.contains(&provider.as_str()) {
            let token = self
                .oauth
                .valid_access_token(&provider)
                .await
                .map_err(|e| AppError::RunFailed(format!("no usable {provider} credential: {e}")))?;
            let handle = match provider.as_str() {
                "copilot" => {
                    self.http_runner
                        .spawn_copilot(
                            task_id.to_string(),
                            token,
                            prompt,
                            self.config.logs_dir.clone(),
                            Arc::clone(&self.bus),
                            tx,
                        )
                        .await
                        .map_err(|e| AppError::RunFailed(e.to_string()))?
                }
                _ => {
                    self.http_runner
                        .spawn_antigravity(
                            task_id.to_string(),
                            token,
                            model.unwrap_or_else(|| "gemini-2.5-pro".to_string()),
                            prompt,
                            self.config.logs_dir.clone(),
                            Arc::clone(&self.bus),
                            tx,
                        )
                        .await
                        .map_err(|e| AppError::RunFailed(e.to_string()))?
                }
            };
            let _ = handle.pid;
        } else {
            self.child_runner
                .spawn(
                    task_id.to_string(),
                    &provider,
                    model.as_deref(),
                    reasoning_effort.as_deref(),
                    &run_dir,
                    &prompt,
                    &self.config.logs_dir,
                    Arc::clone(&self.bus),
                    tx,
                )
                .await
                .map_err(|e| AppError::RunFailed(e.to_string()))?;
        }

        // 7. On close, the completion handler runs.
        let orchestrator = Arc::clone(self);
        let task_id = task_id.to_string();
        tokio::spawn(async move { orchestrator.handle_runner_events(task_id, rx).await });

        Ok(())
    }

    /// §4.8 step 1: prefer the stored project path, otherwise sniff the
    /// directive text for an absolute path, a `~/…` path, or a known
    /// directory name under `$HOME/Projects`; otherwise the server cwd.
    fn resolve_project_path(&self, task: &TaskRow) -> PathBuf {
        if let Some(path) = &task.project_path {
            return PathBuf::from(path);
        }

        let text = format!("{} {}", task.title, task.description.as_deref().unwrap_or_default());
        if let Some(home) = dirs_home() {
            let projects_root = home.join("Projects");
            if let Ok(entries) = std::fs::read_dir(&projects_root) {
                let lowered = text.to_lowercase();
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if lowered.contains(&name.to_lowercase()) {
                        return projects_root.join(name);
                    }
                }
            }
            if let Some(rest) = text.split("~/").nth(1) {
                let token = rest.split_whitespace().next().unwrap_or_default();
                if !token.is_empty() {
                    return home.join(token);
                }
            }
        }

        for token in text.split_whitespace() {
            if token.starts_with('/') {
                return PathBuf::from(token);
            }
        }

        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }

    /// §4.8 step 3.
    fn compose_execution_prompt(&self, task: &TaskRow, agent: &AgentRow) -> Result<String, AppError> {
        let history = queries::recent_conversation_for_agent(&self.db, &agent.id, 10)?;
        let mut history_text = String::new();
        for msg in &history {
            history_text.push_str(&format!("- [{}] {}\n", msg.sender_type, msg.content));
        }

        let provider = agent.cli_provider.as_deref().unwrap_or("claude");
        let needs_plan_contract = matches!(provider, "gemini" | "copilot" | "antigravity");

        let mut prompt = String::new();
        prompt.push_str(&format!("Task: {}\n", task.title));
        if let Some(desc) = &task.description {
            prompt.push_str(&format!("Description: {desc}\n"));
        }
        prompt.push_str(&format!(
            "You are {} ({}), role: {}.\n",
            agent.name, agent.department_id.as_deref().unwrap_or("general"), agent.role
        ));
        if let Some(personality) = &agent.personality {
            prompt.push_str(&format!("Personality: {personality}\n"));
        }
        prompt.push_str(crate::runtime::meeting::role_constraint(
            agent.department_id.as_deref().unwrap_or("development"),
        ));
        prompt.push('\n');
        if !history_text.is_empty() {
            prompt.push_str("\nRecent conversation:\n");
            prompt.push_str(&history_text);
        }
        if needs_plan_contract {
            prompt.push_str(
                "\nBefore starting, emit a single line `{\"subtasks\":[{\"title\":\"…\"}, ...]}` \
                 listing your planned subtasks. After finishing each one, emit \
                 `{\"subtask_done\":\"<title>\"}` on its own line.\n",
            );
        }
        Ok(prompt)
    }

    fn spawn_progress_timer(self: &Arc<Self>, task_id: String, agent: AgentRow) {
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(PROGRESS_TICK).await;
                let Ok(Some(task)) = queries::get_task(&orchestrator.db, &task_id) else { break };
                if task.status != "in_progress" {
                    break;
                }
                let report = format!("{} is still working on \"{}\". Progress continues.", agent.name, task.title);
                let _ = queries::insert_message(
                    &orchestrator.db,
                    &MessageRow {
                        id: uuid::Uuid::new_v4().to_string(),
                        sender_type: "agent".to_string(),
                        sender_id: Some(agent.id.clone()),
                        receiver_type: "ceo".to_string(),
                        receiver_id: None,
                        content: report,
                        message_type: "progress".to_string(),
                        task_id: Some(task_id.clone()),
                        created_at: chrono::Utc::now().to_rfc3339(),
                    },
                );
                orchestrator.bus.emit(
                    event_types::EVENT_NEW_MESSAGE,
                    Some(task_id.clone()),
                    serde_json::json!({ "taskId": task_id }),
                );
            }
        });
        self.progress_timers.insert(task_id, handle);
    }

    fn resolve_model_settings(&self, provider: &str) -> Result<(Option<String>, Option<String>), AppError> {
        let model = queries::get_setting(&self.db, &format!("model:{provider}"))?;
        let reasoning_effort = queries::get_setting(&self.db, "reasoning_effort")?;
        Ok((model, reasoning_effort))
    }

    /// Reads `events_tx`/`rx` until the child closes, turning `Subtask`
    /// events into subtask-row writes and the final `Exited` into a call
    /// to the completion handler.
    async fn handle_runner_events(
        self: Arc<Self>,
        task_id: String,
        mut rx: mpsc::UnboundedReceiver<ChildRunnerEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            match event {
                ChildRunnerEvent::Subtask(SubtaskEvent::Created { tool_use_id, title }) => {
                    let now = chrono::Utc::now().to_rfc3339();
                    let _ = queries::insert_subtask(
                        &self.db,
                        &queries::SubtaskRow {
                            id: uuid::Uuid::new_v4().to_string(),
                            task_id: task_id.clone(),
                            title,
                            description: None,
                            status: "in_progress".to_string(),
                            assigned_agent_id: None,
                            blocked_reason: None,
                            cli_tool_use_id: Some(tool_use_id),
                            target_department_id: None,
                            delegated_task_id: None,
                            created_at: now.clone(),
                            updated_at: now,
                        },
                    );
                    self.bus.emit(
                        event_types::EVENT_SUBTASK_UPDATE,
                        Some(task_id.clone()),
                        serde_json::json!({ "taskId": task_id }),
                    );
                }
                ChildRunnerEvent::Subtask(SubtaskEvent::Completed { tool_use_id }) => {
                    if let Ok(Some(subtask)) =
                        queries::get_subtask_by_tool_use_id(&self.db, &task_id, &tool_use_id)
                    {
                        let _ = queries::update_subtask_status(&self.db, &subtask.id, "done", None);
                        self.bus.emit(
                            event_types::EVENT_SUBTASK_UPDATE,
                            Some(task_id.clone()),
                            serde_json::json!({ "taskId": task_id }),
                        );
                    }
                }
                ChildRunnerEvent::Exited { code } => {
                    self.handle_completion(&task_id, code).await;
                    break;
                }
            }
        }
    }

    /// §4.10, the 8-step completion handler.
    async fn handle_completion(self: &Arc<Self>, task_id: &str, code: i32) {
        // 1. Drop timer/process bookkeeping.
        if let Some((_, handle)) = self.progress_timers.remove(task_id) {
            handle.abort();
        }

        // 2. Late-event guard.
        let was_stop_requested = self.stop_requested.remove(task_id).is_some();
        let Ok(Some(task)) = queries::get_task(&self.db, task_id) else {
            self.delegation.discard_continuations(task_id);
            return;
        };
        if was_stop_requested || task.status != "in_progress" {
            let _ = queries::insert_task_log(&self.db, task_id, "completion", "completion ignored: stop-requested or not in_progress");
            self.delegation.discard_continuations(task_id);
            return;
        }

        // 3. Tail the run log into task.result.
        let log_path = self.config.logs_dir.join(format!("{task_id}.log"));
        let tail = tail_bytes(&log_path, 2000);
        let _ = queries::update_task(&self.db, task_id, &TaskPatch { result: Some(Some(tail.clone())), ..Default::default() });

        let success = code == 0;

        if success {
            // 4. Auto-complete local subtasks, then trigger subtask delegation.
            let _ = queries::auto_complete_local_subtasks(&self.db, task_id);
            let engine = Arc::clone(&self.delegation);
            let pid = task_id.to_string();
            tokio::spawn(async move {
                let _ = engine.delegate_subtasks(&pid).await;
            });
        }

        // 5. Free the agent, award xp on success.
        if let Some(agent_id) = &task.assigned_agent_id {
            if success {
                let _ = queries::update_agent(
                    &self.db,
                    agent_id,
                    &AgentPatch { status: Some("idle".to_string()), current_task_id: Some(None), ..Default::default() },
                );
                let _ = queries::award_task_completion(&self.db, agent_id);
            } else {
                let _ = queries::update_agent(
                    &self.db,
                    agent_id,
                    &AgentPatch { status: Some("idle".to_string()), current_task_id: Some(None), ..Default::default() },
                );
            }
            self.bus.emit(
                event_types::EVENT_AGENT_STATUS,
                None,
                serde_json::json!({ "agentId": agent_id, "status": "idle" }),
            );
        }

        if success {
            // 6. Move to review, schedule the review sequence.
            let _ = queries::update_task(
                &self.db,
                task_id,
                &TaskPatch { status: Some("review".to_string()), ..Default::default() },
            );
            self.bus.emit(
                event_types::EVENT_TASK_UPDATE,
                Some(task_id.to_string()),
                serde_json::json!({ "taskId": task_id, "status": "review" }),
            );
            let orchestrator = Arc::clone(self);
            let pid = task_id.to_string();
            tokio::spawn(async move { orchestrator.schedule_review_sequence(pid).await });
        } else {
            // 8. Reset to inbox, abandon the worktree, notify, still fire queues.
            let _ = queries::update_task(
                &self.db,
                task_id,
                &TaskPatch { status: Some("inbox".to_string()), ..Default::default() },
            );
            let (_, _) = self.worktrees.rollback_task_worktree(task_id, "run_failed");

            if let Some(agent_id) = &task.assigned_agent_id {
                let failure_tail: String = tail.chars().rev().take(300).collect::<Vec<_>>().into_iter().rev().collect();
                let pretty = pretty_print(&failure_tail);
                let _ = queries::insert_message(
                    &self.db,
                    &MessageRow {
                        id: uuid::Uuid::new_v4().to_string(),
                        sender_type: "agent".to_string(),
                        sender_id: Some(agent_id.clone()),
                        receiver_type: "ceo".to_string(),
                        receiver_id: None,
                        content: format!("Run failed (exit {code}):\n{pretty}"),
                        message_type: "failure".to_string(),
                        task_id: Some(task_id.to_string()),
                        created_at: chrono::Utc::now().to_rfc3339(),
                    },
                );
                self.bus.emit(
                    event_types::EVENT_NEW_MESSAGE,
                    Some(task_id.to_string()),
                    serde_json::json!({ "taskId": task_id }),
                );
            }

            self.bus.emit(
                event_types::EVENT_TASK_UPDATE,
                Some(task_id.to_string()),
                serde_json::json!({ "taskId": task_id, "status": "inbox" }),
            );

            let delegation = Arc::clone(&self.delegation);
            let pid = task_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                let _ = delegation.on_subtask_child_done(&pid, false).await;
                delegation.on_cross_dept_child_done(&pid).await;
            });
        }
    }

    async fn schedule_review_sequence(self: &Arc<Self>, task_id: String) {
        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;

        let Ok(Some(task)) = queries::get_task(&self.db, &task_id) else { return };
        if task.status != "review" {
            return;
        }
        let diff_summary = self.worktrees.worktree_diff_summary(&task_id);
        let tail = pretty_print(&task.result.clone().unwrap_or_default());
        if let Some(agent_id) = &task.assigned_agent_id {
            let _ = queries::insert_message(
                &self.db,
                &MessageRow {
                    id: uuid::Uuid::new_v4().to_string(),
                    sender_type: "agent".to_string(),
                    sender_id: Some(agent_id.clone()),
                    receiver_type: "ceo".to_string(),
                    receiver_id: None,
                    content: format!("Work ready for review.\n{tail}\n\nDiff: {diff_summary}"),
                    message_type: "report".to_string(),
                    task_id: Some(task_id.clone()),
                    created_at: chrono::Utc::now().to_rfc3339(),
                },
            );
            self.bus.emit(
                event_types::EVENT_NEW_MESSAGE,
                Some(task_id.clone()),
                serde_json::json!({ "taskId": task_id }),
            );
        }

        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        self.finish_review(&task_id).await;
    }

    /// §4.9 subtask delegation's tail condition, and §4.10 step 7: a no-op
    /// while any subtask is still incomplete.
    async fn finish_review(self: &Arc<Self>, task_id: &str) {
        let Ok(Some(task)) = queries::get_task(&self.db, task_id) else { return };
        if task.status != "review" {
            return;
        }
        match queries::subtasks_all_done(&self.db, task_id) {
            Ok(true) => {}
            _ => {
                let _ = queries::insert_task_log(
                    &self.db,
                    task_id,
                    "review",
                    "review waiting: subtasks still incomplete",
                );
                return;
            }
        }

        let project_dir = self.resolve_project_path(&task);
        let locale_text = format!("{} {}", task.title, task.description.as_deref().unwrap_or_default());
        let locale = resolve_locale(&locale_text, None);
        let department_id = task.department_id.clone().unwrap_or_else(|| "development".to_string());
        let mentions = scan_mentioned_departments(&locale_text, &department_id);

        let outcome = self
            .meetings
            .run_round(
                &self.db,
                &self.bus,
                &project_dir,
                &self.config.logs_dir,
                MeetingKind::Review,
                task_id,
                &task.title,
                locale.as_str(),
                &department_id,
                &mentions,
            )
            .await;

        let Ok(Some(outcome)) = outcome else { return };
        if outcome.needs_revision {
            // §4.9 step 6: toggle review -> in_progress -> review so the UI
            // visibly represents the rework, then re-enter the meeting.
            let _ = queries::update_task(
                &self.db,
                task_id,
                &TaskPatch { status: Some("in_progress".to_string()), ..Default::default() },
            );
            self.bus.emit(
                event_types::EVENT_TASK_UPDATE,
                Some(task_id.to_string()),
                serde_json::json!({ "taskId": task_id, "status": "in_progress" }),
            );
            tokio::time::sleep(std::time::Duration::from_millis(2600)).await;
            let _ = queries::update_task(
                &self.db,
                task_id,
                &TaskPatch { status: Some("review".to_string()), ..Default::default() },
            );
            self.bus.emit(
                event_types::EVENT_TASK_UPDATE,
                Some(task_id.to_string()),
                serde_json::json!({ "taskId": task_id, "status": "review" }),
            );

            let orchestrator = Arc::clone(self);
            let pid = task_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(2200)).await;
                orchestrator.finish_review(&pid).await;
            });
            return;
        }

        let mut merge_note = String::new();
        if self.worktrees.get(task_id).is_some() {
            match self.worktrees.merge_worktree(task_id) {
                Ok(result) if result.strategy == MergeStrategy::Conflict => {
                    let _ = queries::insert_message(
                        &self.db,
                        &MessageRow {
                            id: uuid::Uuid::new_v4().to_string(),
                            sender_type: "system".to_string(),
                            sender_id: None,
                            receiver_type: "ceo".to_string(),
                            receiver_id: None,
                            content: format!(
                                "Merge conflict on task \"{}\": {}. Worktree left in place for manual resolution.",
                                task.title,
                                result.conflicted_files.join(", ")
                            ),
                            message_type: "conflict".to_string(),
                            task_id: Some(task_id.to_string()),
                            created_at: chrono::Utc::now().to_rfc3339(),
                        },
                    );
                    self.bus.emit(
                        event_types::EVENT_NEW_MESSAGE,
                        Some(task_id.to_string()),
                        serde_json::json!({ "taskId": task_id }),
                    );
                    return;
                }
                Ok(result) => merge_note = result.message,
                Err(err) => merge_note = format!("merge error: {err}"),
            }
        }

        let _ = queries::update_task(
            &self.db,
            task_id,
            &TaskPatch { status: Some("done".to_string()), ..Default::default() },
        );
        let _ = queries::insert_task_log(&self.db, task_id, "review", &format!("task done. {merge_note}"));
        self.bus.emit(
            event_types::EVENT_TASK_UPDATE,
            Some(task_id.to_string()),
            serde_json::json!({ "taskId": task_id, "status": "done" }),
        );

        self.delegation.on_cross_dept_child_done(task_id).await;
        let _ = self.delegation.on_subtask_child_done(task_id, true).await;
        self.usage_probe.refresh_all().await;
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn tail_bytes(path: &Path, max_bytes: usize) -> String {
    let Ok(bytes) = std::fs::read(path) else { return String::new() };
    let start = bytes.len().saturating_sub(max_bytes);
    String::from_utf8_lossy(&bytes[start..]).to_string()
}
