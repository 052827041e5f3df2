//! Delegation Engine (§4.9): turns a CEO directive into a parent task, a
//! planned-approval meeting, an internal assignment, a strictly sequential
//! cross-department cooperation queue, and per-subtask foreign-department
//! delegations once the main CLI run closes.
//!
//! The continuation-map/callback-on-completion shape follows the
//! orchestrator's general event-driven style, adapted from "delegate a
//! tool call to a sub-agent" to "delegate a task to another department".

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;

use crate::bus::{event_types, EventBus};
use crate::core::department::{scan_mentioned_departments, Role, DEPARTMENTS};
use crate::db::queries::{self, AgentRow, MessageRow, SubtaskRow, TaskPatch, TaskRow};
use crate::db::{Database, DbError};
use crate::runtime::meeting::{MeetingEngine, MeetingKind};

/// Callback the orchestrator implements so the Delegation Engine can kick
/// off task execution (§4.8) without depending on the orchestrator module
/// directly.
#[async_trait]
pub trait TaskStarter: Send + Sync {
    async fn start_task(&self, task_id: &str);
}

pub struct DelegationEngine {
    db: Arc<Database>,
    bus: Arc<EventBus>,
    starter: Arc<dyn TaskStarter>,
    meetings: Arc<MeetingEngine>,
    logs_dir: PathBuf,
    /// `crossDeptNextCallbacks[childTaskId]` — what to do once a
    /// cross-department child task reaches review/done.
    cross_dept_next: DashMap<String, CrossDeptContinuation>,
    /// `subtaskDelegationCallbacks[childTaskId]` — which parent subtask to
    /// resolve, and the remaining sibling queue, once a delegated child
    /// task finishes.
    subtask_next: DashMap<String, SubtaskContinuation>,
}

#[derive(Clone)]
struct CrossDeptContinuation {
    originator_agent_id: String,
    originator_title: String,
    originator_message: String,
    project_path: Option<String>,
    remaining: Vec<&'static str>,
    on_all_done: Option<String>,
}

#[derive(Clone)]
struct SubtaskContinuation {
    parent_task_id: String,
    subtask_id: String,
    remaining: Vec<SubtaskRow>,
}

impl DelegationEngine {
    pub fn new(
        db: Arc<Database>,
        bus: Arc<EventBus>,
        starter: Arc<dyn TaskStarter>,
        meetings: Arc<MeetingEngine>,
        logs_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            bus,
            starter,
            meetings,
            logs_dir,
            cross_dept_next: DashMap::new(),
            subtask_next: DashMap::new(),
        }
    }

    /// `scheduleAgentReply`: dispatch a CEO message addressed to `agent`.
    /// Team-leader `task_assign` messages run the full delegation flow;
    /// everything else gets a one-shot direct reply after a short jitter.
    pub async fn schedule_agent_reply(
        self: &Arc<Self>,
        agent: &AgentRow,
        message_type: &str,
        content: &str,
    ) -> Result<(), DbError> {
        if agent.role == Role::TeamLeader.as_str() && message_type == "task_assign" {
            self.run_delegation_flow(agent, content).await
        } else {
            let engine = Arc::clone(self);
            let agent = agent.clone();
            let content = content.to_string();
            tokio::spawn(async move {
                jitter(1000, 3000).await;
                engine.post_direct_reply(&agent, &content).await;
            });
            Ok(())
        }
    }

    async fn post_direct_reply(&self, agent: &AgentRow, _directive: &str) {
        let _ = queries::insert_message(
            &self.db,
            &MessageRow {
                id: uuid::Uuid::new_v4().to_string(),
                sender_type: "agent".to_string(),
                sender_id: Some(agent.id.clone()),
                receiver_type: "ceo".to_string(),
                receiver_id: None,
                content: "Got it, on it.".to_string(),
                message_type: "chat".to_string(),
                task_id: None,
                created_at: chrono::Utc::now().to_rfc3339(),
            },
        );
        self.bus.emit(
            event_types::EVENT_NEW_MESSAGE,
            None,
            serde_json::json!({ "senderId": agent.id }),
        );
    }

    /// The full delegation flow for a team-leader `task_assign` directive
    /// (§4.9 "Delegation flow").
    async fn run_delegation_flow(self: &Arc<Self>, leader: &AgentRow, directive: &str) -> Result<(), DbError> {
        jitter(1000, 2000).await;

        let department_id = leader.department_id.clone().unwrap_or_default();
        let project_path = detect_project_path(directive);

        let task_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        queries::insert_task(
            &self.db,
            &TaskRow {
                id: task_id.clone(),
                title: directive.chars().take(120).collect(),
                description: Some(format!("[CEO] {directive}")),
                department_id: Some(department_id.clone()),
                assigned_agent_id: Some(leader.id.clone()),
                status: "planned".to_string(),
                priority: 1,
                task_type: None,
                project_path: project_path.clone(),
                result: None,
                started_at: None,
                completed_at: None,
                created_at: now.clone(),
                updated_at: now,
            },
        )?;
        queries::insert_task_log(&self.db, &task_id, "delegation", "directive handed off to team leader")?;

        let mentions = scan_mentioned_departments(directive, &department_id);
        let is_planning = department_id == "planning";

        // §4.9 step 6: a planned-approval round that comes back
        // `needs_revision` schedules a follow-up round after 2.2s rather
        // than failing the directive outright.
        loop {
            let outcome = self
                .run_planned_approval(&task_id, directive, &department_id, &mentions)
                .await?;
            if !outcome.needs_revision {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2200)).await;
        }

        self.seed_approved_plan_subtasks(&task_id, leader, &mentions)?;

        if is_planning && !mentions.is_empty() {
            self.run_cross_dept_queue(&task_id, leader, directive, project_path.clone(), mentions, None).await;
            self.run_internal_delegation(&task_id, leader).await?;
        } else if is_planning {
            self.run_internal_delegation(&task_id, leader).await?;
        } else if !mentions.is_empty() {
            self.run_internal_delegation(&task_id, leader).await?;
            let engine = Arc::clone(self);
            let leader = leader.clone();
            let directive = directive.to_string();
            let task_id_clone = task_id.clone();
            tokio::spawn(async move {
                jitter(3000, 4000).await;
                engine.run_cross_dept_queue(&task_id_clone, &leader, &directive, project_path, mentions, None).await;
            });
        } else {
            self.run_internal_delegation(&task_id, leader).await?;
        }

        Ok(())
    }

    /// §4.7/§4.9 step 3: run one round of the planned-approval meeting for
    /// `task_id`, facilitated by the primary department's team leader with
    /// every mentioned department's leader as a participant.
    async fn run_planned_approval(
        &self,
        task_id: &str,
        directive: &str,
        department_id: &str,
        mentions: &[&'static str],
    ) -> Result<PlannedOutcome, DbError> {
        let project_dir = detect_project_path(directive)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let title: String = directive.chars().take(120).collect();

        let outcome = self
            .meetings
            .run_round(
                &self.db,
                &self.bus,
                &project_dir,
                &self.logs_dir,
                MeetingKind::Planned,
                task_id,
                &title,
                directive,
                department_id,
                mentions,
            )
            .await?;

        Ok(PlannedOutcome { needs_revision: outcome.map(|o| o.needs_revision).unwrap_or(false) })
    }

    /// §4.9 step 4: write the three seeded subtask kinds once a plan is
    /// approved.
    fn seed_approved_plan_subtasks(
        &self,
        task_id: &str,
        assignee: &AgentRow,
        mentions: &[&'static str],
    ) -> Result<(), DbError> {
        let now = chrono::Utc::now().to_rfc3339();

        queries::insert_subtask(
            &self.db,
            &SubtaskRow {
                id: uuid::Uuid::new_v4().to_string(),
                task_id: task_id.to_string(),
                title: "finalize detailed execution plan".to_string(),
                description: None,
                status: "pending".to_string(),
                assigned_agent_id: Some(assignee.id.clone()),
                blocked_reason: None,
                cli_tool_use_id: None,
                target_department_id: None,
                delegated_task_id: None,
                created_at: now.clone(),
                updated_at: now.clone(),
            },
        )?;

        for dept_id in mentions {
            let dept_name = DEPARTMENTS.iter().find(|d| d.id == *dept_id).map(|d| d.name).unwrap_or(dept_id);
            let leader = queries::get_department_leader(&self.db, dept_id)?;
            queries::insert_subtask(
                &self.db,
                &SubtaskRow {
                    id: uuid::Uuid::new_v4().to_string(),
                    task_id: task_id.to_string(),
                    title: format!("produce {dept_name} deliverable"),
                    description: None,
                    status: "blocked".to_string(),
                    assigned_agent_id: leader.map(|l| l.id),
                    blocked_reason: Some(format!("awaiting {dept_name} handoff")),
                    cli_tool_use_id: None,
                    target_department_id: Some(dept_id.to_string()),
                    delegated_task_id: None,
                    created_at: now.clone(),
                    updated_at: now.clone(),
                },
            )?;
        }

        queries::insert_subtask(
            &self.db,
            &SubtaskRow {
                id: uuid::Uuid::new_v4().to_string(),
                task_id: task_id.to_string(),
                title: "consolidate deliverables".to_string(),
                description: None,
                status: "pending".to_string(),
                assigned_agent_id: Some(assignee.id.clone()),
                blocked_reason: None,
                cli_tool_use_id: None,
                target_department_id: None,
                delegated_task_id: None,
                created_at: now.clone(),
                updated_at: now,
            },
        )?;

        Ok(())
    }

    /// §4.9 step 5: internal delegation within the leader's own
    /// department.
    async fn run_internal_delegation(&self, task_id: &str, leader: &AgentRow) -> Result<(), DbError> {
        let department_id = leader.department_id.clone().unwrap_or_default();
        let subordinate = queries::pick_best_subordinate(&self.db, &department_id, &leader.id)?;
        let assignee = subordinate.unwrap_or_else(|| leader.clone());

        queries::update_task(
            &self.db,
            task_id,
            &TaskPatch { assigned_agent_id: Some(Some(assignee.id.clone())), ..Default::default() },
        )?;

        let _ = queries::insert_message(
            &self.db,
            &MessageRow {
                id: uuid::Uuid::new_v4().to_string(),
                sender_type: "agent".to_string(),
                sender_id: Some(leader.id.clone()),
                receiver_type: "agent".to_string(),
                receiver_id: Some(assignee.id.clone()),
                content: "task_assign".to_string(),
                message_type: "task_assign".to_string(),
                task_id: Some(task_id.to_string()),
                created_at: chrono::Utc::now().to_rfc3339(),
            },
        );

        jitter(1000, 2000).await;

        queries::update_task(
            &self.db,
            task_id,
            &TaskPatch { status: Some("in_progress".to_string()), ..Default::default() },
        )?;

        self.starter.start_task(task_id).await;
        Ok(())
    }

    /// §4.9 "Cross-department sequential queue": process `queue` one
    /// department at a time, registering a continuation so the next
    /// department starts only once the current child task reaches review.
    async fn run_cross_dept_queue(
        self: &Arc<Self>,
        originating_task_id: &str,
        originator: &AgentRow,
        directive: &str,
        project_path: Option<String>,
        mut queue: Vec<&'static str>,
        on_all_done: Option<String>,
    ) {
        if queue.is_empty() {
            return;
        }
        let dept_id = queue.remove(0);
        let Ok(Some(receiver)) = queries::get_department_leader(&self.db, dept_id) else { return };

        self.bus.emit(
            event_types::EVENT_CROSS_DEPT_DELIVERY,
            Some(originating_task_id.to_string()),
            serde_json::json!({ "from": originator.id, "to": receiver.id, "department": dept_id }),
        );

        jitter(1500, 2500).await;

        let assignee = queries::pick_best_subordinate(&self.db, dept_id, &receiver.id)
            .ok()
            .flatten()
            .unwrap_or_else(|| receiver.clone());

        let child_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let title = format!("[Collaboration] {}", directive.chars().take(100).collect::<String>());
        let _ = queries::insert_task(
            &self.db,
            &TaskRow {
                id: child_id.clone(),
                title,
                description: Some(format!("[Cross-dept from {}] {directive}", originator.department_id.clone().unwrap_or_default())),
                department_id: Some(dept_id.to_string()),
                assigned_agent_id: Some(assignee.id.clone()),
                status: "planned".to_string(),
                priority: 1,
                task_type: None,
                project_path: project_path.clone(),
                result: None,
                started_at: None,
                completed_at: None,
                created_at: now.clone(),
                updated_at: now,
            },
        );
        let _ = queries::update_task(
            &self.db,
            &child_id,
            &TaskPatch { status: Some("in_progress".to_string()), ..Default::default() },
        );

        self.cross_dept_next.insert(
            child_id.clone(),
            CrossDeptContinuation {
                originator_agent_id: originator.id.clone(),
                originator_title: directive.to_string(),
                originator_message: directive.to_string(),
                project_path,
                remaining: queue,
                on_all_done,
            },
        );

        self.starter.start_task(&child_id).await;
    }

    /// Drops any registered continuation for `child_task_id` without firing
    /// it — used by the completion handler's late-event guard (§4.10 step
    /// 2) so a stopped/vanished task never silently advances a queue.
    pub fn discard_continuations(&self, child_task_id: &str) {
        self.cross_dept_next.remove(child_task_id);
        self.subtask_next.remove(child_task_id);
    }

    /// Called by the orchestrator when a child task registered in the
    /// cross-dept queue reaches `review` (success) so the next department
    /// in line can start.
    pub async fn on_cross_dept_child_done(self: &Arc<Self>, child_task_id: &str) {
        let Some((_, cont)) = self.cross_dept_next.remove(child_task_id) else { return };
        if cont.remaining.is_empty() {
            if let Some(callback_task_id) = cont.on_all_done {
                self.starter.start_task(&callback_task_id).await;
            }
            return;
        }
        let Ok(Some(originator)) = queries::get_agent(&self.db, &cont.originator_agent_id) else { return };
        self.run_cross_dept_queue(
            child_task_id,
            &originator,
            &cont.originator_message,
            cont.project_path,
            cont.remaining,
            cont.on_all_done,
        )
        .await;
    }

    /// §4.9 "Subtask delegation": after the main CLI closes successfully,
    /// delegate every subtask whose `target_department_id` is set and not
    /// yet linked to a child task, one at a time.
    pub async fn delegate_subtasks(self: &Arc<Self>, parent_task_id: &str) -> Result<(), DbError> {
        let all_subtasks = queries::list_subtasks_for_task(&self.db, parent_task_id)?;
        let mut pending: Vec<SubtaskRow> = all_subtasks
            .iter()
            .filter(|s| s.target_department_id.is_some() && s.delegated_task_id.is_none())
            .cloned()
            .collect();

        if pending.is_empty() {
            return Ok(());
        }
        let first = pending.remove(0);
        self.delegate_one_subtask(parent_task_id, first, pending, &all_subtasks).await
    }

    async fn delegate_one_subtask(
        self: &Arc<Self>,
        parent_task_id: &str,
        subtask: SubtaskRow,
        remaining: Vec<SubtaskRow>,
        siblings: &[SubtaskRow],
    ) -> Result<(), DbError> {
        let dept_id = subtask.target_department_id.clone().unwrap_or_default();
        let Some(leader) = queries::get_department_leader(&self.db, &dept_id)? else { return Ok(()) };
        let assignee = queries::pick_best_subordinate(&self.db, &dept_id, &leader.id)?.unwrap_or(leader.clone());

        let scope_prompt = build_sibling_context_prompt(&subtask, siblings);

        let child_id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let parent = queries::get_task(&self.db, parent_task_id)?;
        queries::insert_task(
            &self.db,
            &TaskRow {
                id: child_id.clone(),
                title: format!("[Collaboration] {}", subtask.title),
                description: Some(scope_prompt),
                department_id: Some(dept_id),
                assigned_agent_id: Some(assignee.id.clone()),
                status: "planned".to_string(),
                priority: 1,
                task_type: None,
                project_path: parent.and_then(|p| p.project_path),
                result: None,
                started_at: None,
                completed_at: None,
                created_at: now.clone(),
                updated_at: now,
            },
        )?;
        queries::set_subtask_delegated_task(&self.db, &subtask.id, &child_id)?;
        queries::update_task(
            &self.db,
            &child_id,
            &TaskPatch { status: Some("in_progress".to_string()), ..Default::default() },
        )?;

        self.subtask_next.insert(
            child_id.clone(),
            SubtaskContinuation {
                parent_task_id: parent_task_id.to_string(),
                subtask_id: subtask.id.clone(),
                remaining,
            },
        );

        self.starter.start_task(&child_id).await;
        Ok(())
    }

    /// Called by the orchestrator when a delegated child task finishes;
    /// resolves the parent subtask (done/blocked by exit code) and kicks
    /// off the next queued sibling. Returns the parent task id when `child_task_id`
    /// was a registered subtask-delegation child, so the orchestrator can check
    /// whether the parent's review can now finalize.
    pub async fn on_subtask_child_done(
        self: &Arc<Self>,
        child_task_id: &str,
        success: bool,
    ) -> Result<Option<String>, DbError> {
        let Some((_, cont)) = self.subtask_next.remove(child_task_id) else { return Ok(None) };

        if success {
            queries::update_subtask_status(&self.db, &cont.subtask_id, "done", None)?;
        } else {
            queries::update_subtask_status(
                &self.db,
                &cont.subtask_id,
                "blocked",
                Some("delegated work did not complete successfully"),
            )?;
        }

        if let Some(next) = cont.remaining.first().cloned() {
            let rest = cont.remaining[1..].to_vec();
            let siblings = queries::list_subtasks_for_task(&self.db, &cont.parent_task_id)?;
            self.delegate_one_subtask(&cont.parent_task_id, next, rest, &siblings).await?;
        }

        Ok(Some(cont.parent_task_id))
    }
}

struct PlannedOutcome {
    needs_revision: bool,
}

fn build_sibling_context_prompt(target: &SubtaskRow, siblings: &[SubtaskRow]) -> String {
    let mut out = String::new();
    out.push_str(&format!("[Cross-dept subtask] {}\n", target.title));
    out.push_str("Sibling subtasks:\n");
    for s in siblings {
        let icon = match s.status.as_str() {
            "done" => "[x]",
            "blocked" => "[!]",
            "in_progress" => "[~]",
            _ => "[ ]",
        };
        out.push_str(&format!("{icon} {}\n", s.title));
    }
    out
}

/// Token scan for `@dept` / `@agent` mention patterns (§4.9
/// "Mention-based delegation").
pub fn scan_mentions(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter_map(|token| token.strip_prefix('@'))
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric() && c != '_').to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// §4.8 step 1: recognize absolute paths, `~/…` paths, and known project
/// directory names under `$HOME/Projects` (case-insensitive) from the
/// directive text.
fn detect_project_path(directive: &str) -> Option<String> {
    for token in directive.split_whitespace() {
        let cleaned = token.trim_matches(|c: char| matches!(c, '.' | ',' | '"' | '\''));
        if cleaned.starts_with('/') {
            return Some(cleaned.to_string());
        }
        if let Some(rest) = cleaned.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                return Some(PathBuf::from(home).join(rest).to_string_lossy().to_string());
            }
        }
    }

    if let Some(home) = std::env::var_os("HOME") {
        let projects_dir = PathBuf::from(home).join("Projects");
        if let Ok(entries) = std::fs::read_dir(&projects_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if directive.to_lowercase().contains(&name.to_lowercase()) {
                    return Some(entry.path().to_string_lossy().to_string());
                }
            }
        }
    }
    None
}

async fn jitter(min_ms: u64, max_ms: u64) {
    let millis = rand::thread_rng().gen_range(min_ms..=max_ms);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_mentions_extracts_department_and_agent_tokens() {
        let mentions = scan_mentions("please loop in @design and @aria on this");
        assert_eq!(mentions, vec!["design".to_string(), "aria".to_string()]);
    }

    #[test]
    fn sibling_context_prompt_renders_status_icons() {
        let target = SubtaskRow {
            id: "s1".into(),
            task_id: "t1".into(),
            title: "write qa plan".into(),
            description: None,
            status: "blocked".into(),
            assigned_agent_id: None,
            blocked_reason: None,
            cli_tool_use_id: None,
            target_department_id: Some("qa".into()),
            delegated_task_id: None,
            created_at: "now".into(),
            updated_at: "now".into(),
        };
        let done = SubtaskRow { status: "done".into(), ..target.clone() };
        let prompt = build_sibling_context_prompt(&target, &[target.clone(), done]);
        assert!(prompt.contains("[!]"));
        assert!(prompt.contains("[x]"));
    }
}
