//! Orchestrator (§4.8-§4.11, §5): the task lifecycle state machine. Owns
//! the process-lifetime maps named in §3's Ownership paragraph and drives
//! every collaborator — Worktree Manager, Child Runner, HTTP Agent Runner,
//! Meeting Engine, Delegation Engine, OAuth Service, Usage Probe — from one
//! place.
//!
//! Grounded on this file's own prior shape (`Orchestrator` holding
//! `Arc<Database>`/`Arc<EventBus>` plus a handle registry, exposed through
//! `new`/lifecycle methods) and on `task_lifecycle.rs`'s general
//! async-state-machine style. Two deliberate departures from that shape,
//! per spec:
//! - recovery *rolls back and cancels* in-flight runs on restart, rather
//!   than resuming them (§1, §5, §8 invariant 9).
//! - `stop_task` kills a real OS process tree and rolls back the worktree,
//!   rather than aborting an in-process `JoinHandle`.

pub mod task_lifecycle;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio::task::JoinHandle;

use crate::bus::{event_types, EventBus};
use crate::config::Config;
use crate::db::queries::{self, AgentPatch, TaskFilter, TaskPatch};
use crate::db::Database;
use crate::error::AppError;
use crate::runtime::child_runner::ChildRunner;
use crate::runtime::delegation::{DelegationEngine, TaskStarter};
use crate::runtime::http_agent_runner::HttpAgentRunner;
use crate::runtime::meeting::MeetingEngine;
use crate::runtime::oauth::OAuthService;
use crate::runtime::usage_probe::UsageProbe;
use crate::runtime::worktree::WorktreeManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    Pause,
    Cancel,
}

impl StopMode {
    fn target_status(self) -> &'static str {
        match self {
            StopMode::Pause => "pending",
            StopMode::Cancel => "cancelled",
        }
    }
}

/// Adapts a `Weak<Orchestrator>` into the `TaskStarter` callback the
/// Delegation Engine needs, so the two can reference each other without an
/// `Arc` cycle: the engine never outlives the orchestrator that owns it.
struct WeakStarter(std::sync::Weak<Orchestrator>);

#[async_trait]
impl TaskStarter for WeakStarter {
    async fn start_task(&self, task_id: &str) {
        if let Some(orchestrator) = self.0.upgrade() {
            orchestrator.run_task(task_id).await;
        }
    }
}

pub struct Orchestrator {
    db: Arc<Database>,
    bus: Arc<EventBus>,
    config: Arc<Config>,
    worktrees: Arc<WorktreeManager>,
    child_runner: Arc<ChildRunner>,
    http_runner: Arc<HttpAgentRunner>,
    meetings: Arc<MeetingEngine>,
    oauth: Arc<OAuthService>,
    usage_probe: Arc<UsageProbe>,
    delegation: Arc<DelegationEngine>,
    /// `progressTimers[taskId]`.
    progress_timers: DashMap<String, JoinHandle<()>>,
    /// `stopRequestedTasks`: level-triggered guard so a late close event is
    /// recognized as benign (§4.10 step 2, §4.11, §5 Cancellation).
    stop_requested: DashMap<String, ()>,
    /// `meetingPresenceUntil[agentId]`: excludes summoned agents from break
    /// rotation (§5 Break rotation).
    meeting_presence_until: DashMap<String, chrono::DateTime<chrono::Utc>>,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        bus: Arc<EventBus>,
        config: Arc<Config>,
        oauth: Arc<OAuthService>,
        usage_probe: Arc<UsageProbe>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &std::sync::Weak<Orchestrator>| {
            let starter: Arc<dyn TaskStarter> = Arc::new(WeakStarter(weak.clone()));
            let meetings = Arc::new(MeetingEngine::new());
            let delegation = Arc::new(DelegationEngine::new(
                db.clone(),
                bus.clone(),
                starter,
                meetings.clone(),
                config.logs_dir.clone(),
            ));
            Orchestrator {
                db,
                bus,
                config,
                worktrees: Arc::new(WorktreeManager::new()),
                child_runner: Arc::new(ChildRunner::new()),
                http_runner: Arc::new(HttpAgentRunner::new()),
                meetings,
                oauth,
                usage_probe,
                delegation,
                progress_timers: DashMap::new(),
                stop_requested: DashMap::new(),
                meeting_presence_until: DashMap::new(),
            }
        })
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn delegation(&self) -> &Arc<DelegationEngine> {
        &self.delegation
    }

    pub fn worktree_diff_summary(&self, task_id: &str) -> String {
        self.worktrees.worktree_diff_summary(task_id)
    }

    /// `/api/tasks/:id/merge` (§4.4): CEO-triggered manual merge of a task's
    /// isolated worktree back to its base branch, outside the usual
    /// review-approval path.
    pub fn merge_task_worktree(&self, task_id: &str) -> Result<crate::runtime::worktree::MergeResult, AppError> {
        Ok(self.worktrees.merge_worktree(task_id)?)
    }

    /// `/api/tasks/:id/discard` (§4.4, §4.11): rolls back a task's worktree
    /// without merging, returning the diff summary that was discarded.
    pub fn discard_task_worktree(&self, task_id: &str) -> String {
        let (summary, _) = self.worktrees.rollback_task_worktree(task_id, "manual_discard");
        summary
    }

    /// Entry point for CEO→agent messages; the Delegation Engine decides
    /// whether this runs the full delegation flow or a one-shot reply
    /// (§4.9 "Directive intake"). The delegation flow involves multi-second
    /// jitters and, for team leaders, a full meeting round, so it runs on a
    /// detached task rather than blocking the caller (a REST handler).
    pub async fn dispatch_ceo_message(
        self: &Arc<Self>,
        agent: &queries::AgentRow,
        message_type: &str,
        content: &str,
    ) -> Result<(), AppError> {
        let delegation = Arc::clone(&self.delegation);
        let agent = agent.clone();
        let message_type = message_type.to_string();
        let content = content.to_string();
        tokio::spawn(async move {
            if let Err(err) = delegation.schedule_agent_reply(&agent, &message_type, &content).await {
                tracing::error!(%err, "delegation flow failed");
            }
        });
        Ok(())
    }

    /// `/api/tasks/:id/stop` (§4.11, §5 Cancellation): the sole
    /// cancellation vector. Marks the task stop-requested before touching
    /// the runner so a close event racing this call is recognized as
    /// benign by the completion handler's late-event guard.
    pub async fn stop_task(self: &Arc<Self>, task_id: &str, mode: StopMode) -> Result<(), AppError> {
        let Some(task) = queries::get_task(&self.db, task_id)? else {
            return Err(AppError::NotFound(format!("task {task_id}")));
        };

        self.stop_requested.insert(task_id.to_string(), ());
        if let Some((_, handle)) = self.progress_timers.remove(task_id) {
            handle.abort();
        }
        self.delegation.discard_continuations(task_id);

        self.child_runner.kill(task_id).await.map_err(|e| AppError::RunFailed(e.to_string()))?;

        let (_, _) = self.worktrees.rollback_task_worktree(task_id, "stop_requested");

        queries::update_task(
            &self.db,
            task_id,
            &TaskPatch { status: Some(mode.target_status().to_string()), ..Default::default() },
        )?;
        if let Some(agent_id) = &task.assigned_agent_id {
            queries::update_agent(
                &self.db,
                agent_id,
                &AgentPatch { status: Some("idle".to_string()), current_task_id: Some(None), ..Default::default() },
            )?;
            self.bus.emit(
                event_types::EVENT_AGENT_STATUS,
                None,
                serde_json::json!({ "agentId": agent_id, "status": "idle" }),
            );
        }

        self.bus.emit(
            event_types::EVENT_TASK_UPDATE,
            Some(task_id.to_string()),
            serde_json::json!({ "taskId": task_id, "status": mode.target_status() }),
        );
        Ok(())
    }

    /// `/api/tasks/:id/resume` (§4.11): only valid from `pending` or
    /// `cancelled`. Goes to `planned` if the task still has an assignee,
    /// else `inbox`.
    pub async fn resume_task(self: &Arc<Self>, task_id: &str) -> Result<(), AppError> {
        let Some(task) = queries::get_task(&self.db, task_id)? else {
            return Err(AppError::NotFound(format!("task {task_id}")));
        };
        if task.status != "pending" && task.status != "cancelled" {
            return Err(AppError::InvalidInput(format!(
                "cannot resume task in status {}",
                task.status
            )));
        }

        self.stop_requested.remove(task_id);
        let next_status = if task.assigned_agent_id.is_some() { "planned" } else { "inbox" };
        queries::update_task(
            &self.db,
            task_id,
            &TaskPatch { status: Some(next_status.to_string()), ..Default::default() },
        )?;
        self.bus.emit(
            event_types::EVENT_TASK_UPDATE,
            Some(task_id.to_string()),
            serde_json::json!({ "taskId": task_id, "status": next_status }),
        );

        if next_status == "planned" {
            let orchestrator = Arc::clone(self);
            let task_id = task_id.to_string();
            tokio::spawn(async move { orchestrator.run_task(&task_id).await });
        }
        Ok(())
    }

    /// §5 Shutdown: kill every active process tree, roll back every
    /// in-flight worktree, free agents, mark in-progress tasks cancelled.
    /// The caller is responsible for closing WS subscribers and the DB
    /// handle and for the force-exit deadline.
    pub async fn shutdown(self: &Arc<Self>) {
        let Ok(tasks) = queries::list_tasks(&self.db, &TaskFilter::default()) else { return };
        for row in tasks {
            if row.task.status != "in_progress" {
                continue;
            }
            let task_id = row.task.id.clone();
            self.stop_requested.insert(task_id.clone(), ());
            if let Some((_, handle)) = self.progress_timers.remove(&task_id) {
                handle.abort();
            }
            self.delegation.discard_continuations(&task_id);
            let _ = self.child_runner.kill(&task_id).await;
            let _ = self.worktrees.rollback_task_worktree(&task_id, "server_shutdown");
            let _ = queries::update_task(
                &self.db,
                &task_id,
                &TaskPatch { status: Some("cancelled".to_string()), ..Default::default() },
            );
            if let Some(agent_id) = &row.task.assigned_agent_id {
                let _ = queries::update_agent(
                    &self.db,
                    agent_id,
                    &AgentPatch {
                        status: Some("idle".to_string()),
                        current_task_id: Some(None),
                        ..Default::default()
                    },
                );
            }
        }
    }

    /// Break rotation (§5): 60 s interval, first tick at +5 s. At most one
    /// agent on break per department; agents summoned to a meeting are
    /// excluded.
    pub fn spawn_break_rotation(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            loop {
                orchestrator.run_break_rotation_tick().await;
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            }
        })
    }

    async fn run_break_rotation_tick(&self) {
        use crate::core::department::DEPARTMENTS;
        let now = chrono::Utc::now();

        for dept in DEPARTMENTS {
            let Ok(agents) = queries::list_agents_in_department(&self.db, dept.id) else { continue };
            let summoned = |id: &str| self.meeting_presence_until.get(id).map(|t| *t > now).unwrap_or(false);

            let mut on_break: Vec<_> = agents.iter().filter(|a| a.status == "break").collect();
            if on_break.len() > 1 {
                for extra in on_break.drain(1..) {
                    let _ = queries::update_agent(
                        &self.db,
                        &extra.id,
                        &AgentPatch { status: Some("idle".to_string()), ..Default::default() },
                    );
                }
            }

            if let Some(agent) = on_break.first() {
                if rand::thread_rng().gen_bool(0.4) {
                    let _ = queries::update_agent(
                        &self.db,
                        &agent.id,
                        &AgentPatch { status: Some("idle".to_string()), ..Default::default() },
                    );
                    self.bus.emit(
                        event_types::EVENT_AGENT_STATUS,
                        None,
                        serde_json::json!({ "agentId": agent.id, "status": "idle" }),
                    );
                }
                continue;
            }

            let idle_candidates: Vec<_> =
                agents.iter().filter(|a| a.status == "idle" && !summoned(&a.id)).collect();
            if let Some(agent) = idle_candidates.first() {
                if rand::thread_rng().gen_bool(0.5) {
                    let _ = queries::update_agent(
                        &self.db,
                        &agent.id,
                        &AgentPatch { status: Some("break".to_string()), ..Default::default() },
                    );
                    self.bus.emit(
                        event_types::EVENT_AGENT_STATUS,
                        None,
                        serde_json::json!({ "agentId": agent.id, "status": "break" }),
                    );
                }
            }
        }
    }
}
