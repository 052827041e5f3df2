use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::core::department::{Role, DEPARTMENTS};

use super::{Database, DbError};

// ---------------------------------------------------------------------------
// Row types — flat structs that map directly to table columns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DepartmentRow {
    pub id: String,
    pub name: String,
    pub name_ko: String,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub sort_order: i64,
    pub agent_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRow {
    pub id: String,
    pub name: String,
    pub name_ko: String,
    pub department_id: Option<String>,
    pub role: String,
    pub cli_provider: Option<String>,
    pub status: String,
    pub current_task_id: Option<String>,
    pub avatar_emoji: Option<String>,
    pub personality: Option<String>,
    pub stats_tasks_done: i64,
    pub stats_xp: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct AgentPatch {
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

#[derive(Debug, Clone, Serialize)]
pub struct TaskRow {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub department_id: Option<String>,
    pub assigned_agent_id: Option<String>,
    pub status: String,
    pub priority: i64,
    pub task_type: Option<String>,
    pub project_path: Option<String>,
    pub result: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskWithCounts {
    #[serde(flatten)]
    pub task: TaskRow,
    pub subtask_count: i64,
    pub subtask_done_count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<String>,
    pub department_id: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
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

#[derive(Debug, Clone, Serialize)]
pub struct SubtaskRow {
    pub id: String,
    pub task_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub assigned_agent_id: Option<String>,
    pub blocked_reason: Option<String>,
    pub cli_tool_use_id: Option<String>,
    pub target_department_id: Option<String>,
    pub delegated_task_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRow {
    pub id: String,
    pub sender_type: String,
    pub sender_id: Option<String>,
    pub receiver_type: String,
    pub receiver_id: Option<String>,
    pub content: String,
    pub message_type: String,
    pub task_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub receiver_type: Option<String>,
    pub receiver_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskLogRow {
    pub id: i64,
    pub task_id: String,
    pub kind: String,
    pub message: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeetingMinutesRow {
    pub id: String,
    pub task_id: String,
    pub meeting_type: String,
    pub round: i64,
    pub title: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeetingMinuteEntryRow {
    pub id: i64,
    pub meeting_id: String,
    pub seq: i64,
    pub speaker_agent_id: Option<String>,
    pub speaker_name: String,
    pub speaker_department: Option<String>,
    pub speaker_role: Option<String>,
    pub message_type: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeetingWithEntries {
    #[serde(flatten)]
    pub meeting: MeetingMinutesRow,
    pub entries: Vec<MeetingMinuteEntryRow>,
}

#[derive(Debug, Clone)]
pub struct OAuthCredentialRow {
    pub provider: String,
    pub source: String,
    pub email: Option<String>,
    pub scope: Option<String>,
    pub expires_at: Option<String>,
    pub encrypted_data: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct OAuthStateRow {
    pub id: String,
    pub provider: String,
    pub verifier: String,
    pub redirect_to: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CliUsageCacheRow {
    pub provider: String,
    pub windows_json: String,
    pub error: Option<String>,
    pub refreshed_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettingRow {
    pub key: String,
    pub value: String,
    pub updated_at: String,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

// ---------------------------------------------------------------------------
// Seeding
// ---------------------------------------------------------------------------

/// Seeds the six departments and a baseline agent roster on first boot, when
/// both tables are empty. Safe to call on every startup.
pub fn seed_departments_and_agents(db: &Database) -> Result<(), DbError> {
    let conn = db.conn();

    let dept_count: i64 = conn.query_row("SELECT COUNT(*) FROM departments", [], |r| r.get(0))?;
    if dept_count == 0 {
        for dept in DEPARTMENTS {
            conn.execute(
                "INSERT INTO departments (id, name, name_ko, icon, color, sort_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![dept.id, dept.name, dept.name_ko, dept.icon, dept.color, dept.sort_order],
            )?;
        }
        tracing::info!("seeded {} departments", DEPARTMENTS.len());
    }

    let agent_count: i64 = conn.query_row("SELECT COUNT(*) FROM agents", [], |r| r.get(0))?;
    if agent_count == 0 {
        let ts = now();
        for dept in DEPARTMENTS {
            let leader_id = format!("{}-lead", dept.id);
            conn.execute(
                "INSERT INTO agents (id, name, name_ko, department_id, role, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'idle', ?6, ?6)",
                params![
                    leader_id,
                    format!("{} Lead", dept.name),
                    format!("{} 팀장", dept.name_ko),
                    dept.id,
                    Role::TeamLeader.as_str(),
                    ts,
                ],
            )?;
        }
        tracing::info!("seeded baseline team-leader roster");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Departments
// ---------------------------------------------------------------------------

pub fn list_departments(db: &Database) -> Result<Vec<DepartmentRow>, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare(
        "SELECT d.id, d.name, d.name_ko, d.icon, d.color, d.sort_order,
                (SELECT COUNT(*) FROM agents a WHERE a.department_id = d.id) AS agent_count
         FROM departments d ORDER BY d.sort_order ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(DepartmentRow {
                id: row.get(0)?,
                name: row.get(1)?,
                name_ko: row.get(2)?,
                icon: row.get(3)?,
                color: row.get(4)?,
                sort_order: row.get(5)?,
                agent_count: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_department_leader(db: &Database, department_id: &str) -> Result<Option<AgentRow>, DbError> {
    let conn = db.conn();
    conn.query_row(
        "SELECT id, name, name_ko, department_id, role, cli_provider, status, current_task_id,
                avatar_emoji, personality, stats_tasks_done, stats_xp, created_at, updated_at
         FROM agents WHERE department_id = ?1 AND role = 'team_leader' LIMIT 1",
        params![department_id],
        row_to_agent,
    )
    .optional()
    .map_err(DbError::from)
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRow> {
    Ok(AgentRow {
        id: row.get(0)?,
        name: row.get(1)?,
        name_ko: row.get(2)?,
        department_id: row.get(3)?,
        role: row.get(4)?,
        cli_provider: row.get(5)?,
        status: row.get(6)?,
        current_task_id: row.get(7)?,
        avatar_emoji: row.get(8)?,
        personality: row.get(9)?,
        stats_tasks_done: row.get(10)?,
        stats_xp: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

const AGENT_COLUMNS: &str = "id, name, name_ko, department_id, role, cli_provider, status, \
    current_task_id, avatar_emoji, personality, stats_tasks_done, stats_xp, created_at, updated_at";

pub fn list_agents(db: &Database) -> Result<Vec<AgentRow>, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents ORDER BY department_id, role"
    ))?;
    let rows = stmt
        .query_map([], row_to_agent)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_agents_in_department(db: &Database, department_id: &str) -> Result<Vec<AgentRow>, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents WHERE department_id = ?1"
    ))?;
    let rows = stmt
        .query_map(params![department_id], row_to_agent)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_agent(db: &Database, id: &str) -> Result<Option<AgentRow>, DbError> {
    let conn = db.conn();
    conn.query_row(
        &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
        params![id],
        row_to_agent,
    )
    .optional()
    .map_err(DbError::from)
}

pub fn insert_agent(db: &Database, row: &AgentRow) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute(
        "INSERT INTO agents (id, name, name_ko, department_id, role, cli_provider, status,
            current_task_id, avatar_emoji, personality, stats_tasks_done, stats_xp,
            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            row.id,
            row.name,
            row.name_ko,
            row.department_id,
            row.role,
            row.cli_provider,
            row.status,
            row.current_task_id,
            row.avatar_emoji,
            row.personality,
            row.stats_tasks_done,
            row.stats_xp,
            row.created_at,
            row.updated_at,
        ],
    )?;
    Ok(())
}

pub fn update_agent(db: &Database, id: &str, patch: &AgentPatch) -> Result<(), DbError> {
    let conn = db.conn();
    let mut sets = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    macro_rules! set_plain {
        ($field:ident, $col:literal) => {
            if let Some(v) = &patch.$field {
                sets.push(format!("{} = ?{}", $col, values.len() + 1));
                values.push(Box::new(v.clone()));
            }
        };
    }
    macro_rules! set_nullable {
        ($field:ident, $col:literal) => {
            if let Some(v) = &patch.$field {
                sets.push(format!("{} = ?{}", $col, values.len() + 1));
                values.push(Box::new(v.clone()));
            }
        };
    }

    set_plain!(name, "name");
    set_plain!(name_ko, "name_ko");
    set_nullable!(department_id, "department_id");
    set_plain!(role, "role");
    set_nullable!(cli_provider, "cli_provider");
    set_nullable!(avatar_emoji, "avatar_emoji");
    set_nullable!(personality, "personality");
    set_plain!(status, "status");
    set_nullable!(current_task_id, "current_task_id");

    if sets.is_empty() {
        return Ok(());
    }

    sets.push(format!("updated_at = ?{}", values.len() + 1));
    values.push(Box::new(now()));

    let sql = format!("UPDATE agents SET {} WHERE id = ?{}", sets.join(", "), values.len() + 1);
    values.push(Box::new(id.to_string()));

    let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();
    let changed = conn.execute(&sql, params.as_slice())?;
    if changed == 0 {
        return Err(DbError::NotFound(format!("agent {id}")));
    }
    Ok(())
}

/// §4.10 step 5: award xp/completions for a successfully finished task.
pub fn award_task_completion(db: &Database, agent_id: &str) -> Result<(), DbError> {
    let conn = db.conn();
    let changed = conn.execute(
        "UPDATE agents SET stats_tasks_done = stats_tasks_done + 1, stats_xp = stats_xp + 10, updated_at = ?1
         WHERE id = ?2",
        params![now(), agent_id],
    )?;
    if changed == 0 {
        return Err(DbError::NotFound(format!("agent {agent_id}")));
    }
    Ok(())
}

/// Picks the best subordinate in `department_id` excluding `exclude_agent_id`,
/// preferring `idle > break > working` status then `senior > junior > intern`
/// seniority (§4.9 internal delegation).
pub fn pick_best_subordinate(
    db: &Database,
    department_id: &str,
    exclude_agent_id: &str,
) -> Result<Option<AgentRow>, DbError> {
    let candidates = list_agents_in_department(db, department_id)?;
    let status_rank = |s: &str| match s {
        "idle" => 2,
        "break" => 1,
        "working" => 0,
        _ => -1,
    };
    Ok(candidates
        .into_iter()
        .filter(|a| a.id != exclude_agent_id && a.role != Role::TeamLeader.as_str())
        .max_by_key(|a| {
            let role_rank = a.role.parse::<Role>().map(|r| r.seniority_rank()).unwrap_or(0);
            (status_rank(&a.status), role_rank)
        }))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        department_id: row.get(3)?,
        assigned_agent_id: row.get(4)?,
        status: row.get(5)?,
        priority: row.get(6)?,
        task_type: row.get(7)?,
        project_path: row.get(8)?,
        result: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

const TASK_COLUMNS: &str = "id, title, description, department_id, assigned_agent_id, status, \
    priority, task_type, project_path, result, started_at, completed_at, created_at, updated_at";

pub fn insert_task(db: &Database, row: &TaskRow) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute(
        &format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)"
        ),
        params![
            row.id,
            row.title,
            row.description,
            row.department_id,
            row.assigned_agent_id,
            row.status,
            row.priority,
            row.task_type,
            row.project_path,
            row.result,
            row.started_at,
            row.completed_at,
            row.created_at,
            row.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_task(db: &Database, id: &str) -> Result<Option<TaskRow>, DbError> {
    let conn = db.conn();
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        params![id],
        row_to_task,
    )
    .optional()
    .map_err(DbError::from)
}

pub fn list_tasks(db: &Database, filter: &TaskFilter) -> Result<Vec<TaskWithCounts>, DbError> {
    let conn = db.conn();
    let mut clauses = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(status) = &filter.status {
        clauses.push(format!("t.status = ?{}", values.len() + 1));
        values.push(Box::new(status.clone()));
    }
    if let Some(dept) = &filter.department_id {
        clauses.push(format!("t.department_id = ?{}", values.len() + 1));
        values.push(Box::new(dept.clone()));
    }
    if let Some(agent) = &filter.agent_id {
        clauses.push(format!("t.assigned_agent_id = ?{}", values.len() + 1));
        values.push(Box::new(agent.clone()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let sql = format!(
        "SELECT t.{cols},
                (SELECT COUNT(*) FROM subtasks s WHERE s.task_id = t.id) AS subtask_count,
                (SELECT COUNT(*) FROM subtasks s WHERE s.task_id = t.id AND s.status = 'done') AS subtask_done_count
         FROM tasks t {where_clause}
         ORDER BY t.updated_at DESC",
        cols = TASK_COLUMNS.replace(", ", ", t."),
    );

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(params.as_slice(), |row| {
            let task = row_to_task(row)?;
            Ok(TaskWithCounts {
                task,
                subtask_count: row.get(14)?,
                subtask_done_count: row.get(15)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn update_task(db: &Database, id: &str, patch: &TaskPatch) -> Result<(), DbError> {
    let conn = db.conn();
    let mut sets = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    macro_rules! set_field {
        ($field:ident, $col:literal) => {
            if let Some(v) = &patch.$field {
                sets.push(format!("{} = ?{}", $col, values.len() + 1));
                values.push(Box::new(v.clone()));
            }
        };
    }

    set_field!(title, "title");
    set_field!(description, "description");
    set_field!(department_id, "department_id");
    set_field!(assigned_agent_id, "assigned_agent_id");
    set_field!(status, "status");
    set_field!(priority, "priority");
    set_field!(task_type, "task_type");
    set_field!(project_path, "project_path");
    set_field!(result, "result");

    if let Some(status) = &patch.status {
        if status == "done" {
            sets.push(format!("completed_at = ?{}", values.len() + 1));
            values.push(Box::new(now()));
        }
        if status == "in_progress" {
            sets.push(format!("started_at = ?{}", values.len() + 1));
            values.push(Box::new(now()));
        }
    }

    if sets.is_empty() {
        return Ok(());
    }

    sets.push(format!("updated_at = ?{}", values.len() + 1));
    values.push(Box::new(now()));

    let sql = format!("UPDATE tasks SET {} WHERE id = ?{}", sets.join(", "), values.len() + 1);
    values.push(Box::new(id.to_string()));

    let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();
    let changed = conn.execute(&sql, params.as_slice())?;
    if changed == 0 {
        return Err(DbError::NotFound(format!("task {id}")));
    }
    Ok(())
}

pub fn delete_task(db: &Database, id: &str) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute("DELETE FROM messages WHERE task_id = ?1", params![id])?;
    let changed = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
    if changed == 0 {
        return Err(DbError::NotFound(format!("task {id}")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subtasks
// ---------------------------------------------------------------------------

fn row_to_subtask(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubtaskRow> {
    Ok(SubtaskRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        assigned_agent_id: row.get(5)?,
        blocked_reason: row.get(6)?,
        cli_tool_use_id: row.get(7)?,
        target_department_id: row.get(8)?,
        delegated_task_id: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

const SUBTASK_COLUMNS: &str = "id, task_id, title, description, status, assigned_agent_id, \
    blocked_reason, cli_tool_use_id, target_department_id, delegated_task_id, created_at, updated_at";

pub fn insert_subtask(db: &Database, row: &SubtaskRow) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute(
        &format!(
            "INSERT INTO subtasks ({SUBTASK_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)"
        ),
        params![
            row.id,
            row.task_id,
            row.title,
            row.description,
            row.status,
            row.assigned_agent_id,
            row.blocked_reason,
            row.cli_tool_use_id,
            row.target_department_id,
            row.delegated_task_id,
            row.created_at,
            row.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_subtask(db: &Database, id: &str) -> Result<Option<SubtaskRow>, DbError> {
    let conn = db.conn();
    conn.query_row(
        &format!("SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE id = ?1"),
        params![id],
        row_to_subtask,
    )
    .optional()
    .map_err(DbError::from)
}

pub fn get_subtask_by_tool_use_id(
    db: &Database,
    task_id: &str,
    tool_use_id: &str,
) -> Result<Option<SubtaskRow>, DbError> {
    let conn = db.conn();
    conn.query_row(
        &format!(
            "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE task_id = ?1 AND cli_tool_use_id = ?2"
        ),
        params![task_id, tool_use_id],
        row_to_subtask,
    )
    .optional()
    .map_err(DbError::from)
}

pub fn list_subtasks_for_task(db: &Database, task_id: &str) -> Result<Vec<SubtaskRow>, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare(&format!(
        "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE task_id = ?1 ORDER BY created_at ASC"
    ))?;
    let rows = stmt
        .query_map(params![task_id], row_to_subtask)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn update_subtask_status(
    db: &Database,
    id: &str,
    status: &str,
    blocked_reason: Option<&str>,
) -> Result<(), DbError> {
    let conn = db.conn();
    let changed = conn.execute(
        "UPDATE subtasks SET status = ?1, blocked_reason = ?2, updated_at = ?3 WHERE id = ?4",
        params![status, blocked_reason, now(), id],
    )?;
    if changed == 0 {
        return Err(DbError::NotFound(format!("subtask {id}")));
    }
    Ok(())
}

pub fn set_subtask_delegated_task(db: &Database, id: &str, delegated_task_id: &str) -> Result<(), DbError> {
    let conn = db.conn();
    let changed = conn.execute(
        "UPDATE subtasks SET delegated_task_id = ?1, status = 'in_progress', updated_at = ?2 WHERE id = ?3",
        params![delegated_task_id, now(), id],
    )?;
    if changed == 0 {
        return Err(DbError::NotFound(format!("subtask {id}")));
    }
    Ok(())
}

/// Auto-completes every subtask of `task_id` that has no foreign
/// `target_department_id` (§4.10 step 4). Returns the number of rows touched.
pub fn auto_complete_local_subtasks(db: &Database, task_id: &str) -> Result<usize, DbError> {
    let conn = db.conn();
    let changed = conn.execute(
        "UPDATE subtasks SET status = 'done', updated_at = ?1
         WHERE task_id = ?2 AND target_department_id IS NULL AND status != 'done'",
        params![now(), task_id],
    )?;
    Ok(changed)
}

pub fn subtasks_all_done(db: &Database, task_id: &str) -> Result<bool, DbError> {
    let conn = db.conn();
    let incomplete: i64 = conn.query_row(
        "SELECT COUNT(*) FROM subtasks WHERE task_id = ?1 AND status != 'done'",
        params![task_id],
        |r| r.get(0),
    )?;
    Ok(incomplete == 0)
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_type: row.get(1)?,
        sender_id: row.get(2)?,
        receiver_type: row.get(3)?,
        receiver_id: row.get(4)?,
        content: row.get(5)?,
        message_type: row.get(6)?,
        task_id: row.get(7)?,
        created_at: row.get(8)?,
    })
}

const MESSAGE_COLUMNS: &str =
    "id, sender_type, sender_id, receiver_type, receiver_id, content, message_type, task_id, created_at";

pub fn insert_message(db: &Database, row: &MessageRow) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute(
        &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)"),
        params![
            row.id,
            row.sender_type,
            row.sender_id,
            row.receiver_type,
            row.receiver_id,
            row.content,
            row.message_type,
            row.task_id,
            row.created_at,
        ],
    )?;
    Ok(())
}

pub fn list_messages(db: &Database, filter: &MessageFilter) -> Result<Vec<MessageRow>, DbError> {
    let conn = db.conn();
    let mut clauses = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(rt) = &filter.receiver_type {
        clauses.push(format!("receiver_type = ?{}", values.len() + 1));
        values.push(Box::new(rt.clone()));
    }
    if let Some(rid) = &filter.receiver_id {
        clauses.push(format!("receiver_id = ?{}", values.len() + 1));
        values.push(Box::new(rid.clone()));
    }
    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let limit = filter.limit.unwrap_or(200);

    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages {where_clause} ORDER BY created_at DESC LIMIT {limit}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|b| b.as_ref()).collect();
    let mut rows = stmt
        .query_map(params.as_slice(), row_to_message)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.reverse();
    Ok(rows)
}

/// Last `n` messages across a CEO<->agent pair and broadcast messages, used
/// to compose execution-prompt conversation context (§4.8 step 3).
pub fn recent_conversation_for_agent(db: &Database, agent_id: &str, n: i64) -> Result<Vec<MessageRow>, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare(
        "SELECT id, sender_type, sender_id, receiver_type, receiver_id, content, message_type, task_id, created_at
         FROM messages
         WHERE (sender_id = ?1 OR receiver_id = ?1 OR receiver_type = 'all')
         ORDER BY created_at DESC LIMIT ?2",
    )?;
    let mut rows = stmt
        .query_map(params![agent_id, n], row_to_message)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.reverse();
    Ok(rows)
}

pub fn delete_messages(db: &Database, agent_id: Option<&str>) -> Result<usize, DbError> {
    let conn = db.conn();
    let changed = match agent_id {
        Some(id) => conn.execute(
            "DELETE FROM messages WHERE sender_id = ?1 OR receiver_id = ?1",
            params![id],
        )?,
        None => conn.execute("DELETE FROM messages", [])?,
    };
    Ok(changed)
}

// ---------------------------------------------------------------------------
// Task logs
// ---------------------------------------------------------------------------

pub fn insert_task_log(db: &Database, task_id: &str, kind: &str, message: &str) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute(
        "INSERT INTO task_logs (task_id, kind, message, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![task_id, kind, message, now()],
    )?;
    Ok(())
}

pub fn list_task_logs(db: &Database, task_id: &str) -> Result<Vec<TaskLogRow>, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare(
        "SELECT id, task_id, kind, message, created_at FROM task_logs WHERE task_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![task_id], |row| {
            Ok(TaskLogRow {
                id: row.get(0)?,
                task_id: row.get(1)?,
                kind: row.get(2)?,
                message: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Meeting minutes
// ---------------------------------------------------------------------------

fn row_to_meeting(row: &rusqlite::Row<'_>) -> rusqlite::Result<MeetingMinutesRow> {
    Ok(MeetingMinutesRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        meeting_type: row.get(2)?,
        round: row.get(3)?,
        title: row.get(4)?,
        status: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
    })
}

const MEETING_COLUMNS: &str = "id, task_id, meeting_type, round, title, status, started_at, completed_at";

pub fn insert_meeting(db: &Database, row: &MeetingMinutesRow) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute(
        &format!("INSERT INTO meeting_minutes ({MEETING_COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)"),
        params![
            row.id,
            row.task_id,
            row.meeting_type,
            row.round,
            row.title,
            row.status,
            row.started_at,
            row.completed_at,
        ],
    )?;
    Ok(())
}

pub fn update_meeting_status(db: &Database, id: &str, status: &str, completed: bool) -> Result<(), DbError> {
    let conn = db.conn();
    if completed {
        conn.execute(
            "UPDATE meeting_minutes SET status = ?1, completed_at = ?2 WHERE id = ?3",
            params![status, now(), id],
        )?;
    } else {
        conn.execute("UPDATE meeting_minutes SET status = ?1 WHERE id = ?2", params![status, id])?;
    }
    Ok(())
}

pub fn latest_meeting_round(db: &Database, task_id: &str, meeting_type: &str) -> Result<i64, DbError> {
    let conn = db.conn();
    let round: Option<i64> = conn.query_row(
        "SELECT MAX(round) FROM meeting_minutes WHERE task_id = ?1 AND meeting_type = ?2",
        params![task_id, meeting_type],
        |r| r.get(0),
    )?;
    Ok(round.unwrap_or(0))
}

pub fn insert_meeting_entry(db: &Database, entry: &MeetingMinuteEntryRow) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute(
        "INSERT INTO meeting_minute_entries
            (meeting_id, seq, speaker_agent_id, speaker_name, speaker_department, speaker_role,
             message_type, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.meeting_id,
            entry.seq,
            entry.speaker_agent_id,
            entry.speaker_name,
            entry.speaker_department,
            entry.speaker_role,
            entry.message_type,
            entry.content,
            entry.created_at,
        ],
    )?;
    Ok(())
}

pub fn get_meeting_with_entries(db: &Database, meeting_id: &str) -> Result<Option<MeetingWithEntries>, DbError> {
    let conn = db.conn();
    let meeting = conn
        .query_row(
            &format!("SELECT {MEETING_COLUMNS} FROM meeting_minutes WHERE id = ?1"),
            params![meeting_id],
            row_to_meeting,
        )
        .optional()?;
    let Some(meeting) = meeting else { return Ok(None) };

    let mut stmt = conn.prepare(
        "SELECT id, meeting_id, seq, speaker_agent_id, speaker_name, speaker_department, speaker_role,
                message_type, content, created_at
         FROM meeting_minute_entries WHERE meeting_id = ?1 ORDER BY seq ASC",
    )?;
    let entries = stmt
        .query_map(params![meeting_id], |row| {
            Ok(MeetingMinuteEntryRow {
                id: row.get(0)?,
                meeting_id: row.get(1)?,
                seq: row.get(2)?,
                speaker_agent_id: row.get(3)?,
                speaker_name: row.get(4)?,
                speaker_department: row.get(5)?,
                speaker_role: row.get(6)?,
                message_type: row.get(7)?,
                content: row.get(8)?,
                created_at: row.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(MeetingWithEntries { meeting, entries }))
}

pub fn list_meetings_for_task(db: &Database, task_id: &str) -> Result<Vec<MeetingWithEntries>, DbError> {
    let conn = db.conn();
    let ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM meeting_minutes WHERE task_id = ?1 ORDER BY meeting_type, round ASC",
        )?;
        stmt.query_map(params![task_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?
    };
    drop(conn);
    ids.iter()
        .filter_map(|id| get_meeting_with_entries(db, id).transpose())
        .collect()
}

// ---------------------------------------------------------------------------
// OAuth
// ---------------------------------------------------------------------------

pub fn upsert_oauth_credential(db: &Database, row: &OAuthCredentialRow) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute(
        "INSERT INTO oauth_credentials
            (provider, source, email, scope, expires_at, encrypted_data, access_token, refresh_token, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(provider) DO UPDATE SET
            source = excluded.source, email = excluded.email, scope = excluded.scope,
            expires_at = excluded.expires_at, encrypted_data = excluded.encrypted_data,
            access_token = excluded.access_token, refresh_token = excluded.refresh_token,
            updated_at = excluded.updated_at",
        params![
            row.provider,
            row.source,
            row.email,
            row.scope,
            row.expires_at,
            row.encrypted_data,
            row.access_token,
            row.refresh_token,
            row.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_oauth_credential(db: &Database, provider: &str) -> Result<Option<OAuthCredentialRow>, DbError> {
    let conn = db.conn();
    conn.query_row(
        "SELECT provider, source, email, scope, expires_at, encrypted_data, access_token, refresh_token, updated_at
         FROM oauth_credentials WHERE provider = ?1",
        params![provider],
        |row| {
            Ok(OAuthCredentialRow {
                provider: row.get(0)?,
                source: row.get(1)?,
                email: row.get(2)?,
                scope: row.get(3)?,
                expires_at: row.get(4)?,
                encrypted_data: row.get(5)?,
                access_token: row.get(6)?,
                refresh_token: row.get(7)?,
                updated_at: row.get(8)?,
            })
        },
    )
    .optional()
    .map_err(DbError::from)
}

pub fn delete_oauth_credential(db: &Database, provider: &str) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute("DELETE FROM oauth_credentials WHERE provider = ?1", params![provider])?;
    Ok(())
}

pub fn insert_oauth_state(db: &Database, row: &OAuthStateRow) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute(
        "INSERT INTO oauth_states (id, provider, verifier, redirect_to, created_at) VALUES (?1,?2,?3,?4,?5)",
        params![row.id, row.provider, row.verifier, row.redirect_to, row.created_at],
    )?;
    Ok(())
}

/// Consumes (deletes) an OAuth state row. Returns `None` if missing or older
/// than the 10-minute TTL (§3 OAuthState, §8 S6).
pub fn consume_oauth_state(db: &Database, id: &str, provider: &str) -> Result<Option<OAuthStateRow>, DbError> {
    let conn = db.conn();
    let row = conn
        .query_row(
            "SELECT id, provider, verifier, redirect_to, created_at FROM oauth_states WHERE id = ?1 AND provider = ?2",
            params![id, provider],
            |row| {
                Ok(OAuthStateRow {
                    id: row.get(0)?,
                    provider: row.get(1)?,
                    verifier: row.get(2)?,
                    redirect_to: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()?;
    conn.execute("DELETE FROM oauth_states WHERE id = ?1", params![id])?;

    let Some(row) = row else { return Ok(None) };
    let created: chrono::DateTime<Utc> = row
        .created_at
        .parse()
        .map_err(|e| DbError::Migration(format!("bad oauth_states timestamp: {e}")))?;
    if Utc::now().signed_duration_since(created) > chrono::Duration::minutes(10) {
        return Ok(None);
    }
    Ok(Some(row))
}

// ---------------------------------------------------------------------------
// CLI usage cache
// ---------------------------------------------------------------------------

pub fn upsert_cli_usage_cache(db: &Database, row: &CliUsageCacheRow) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute(
        "INSERT INTO cli_usage_cache (provider, windows_json, error, refreshed_at) VALUES (?1,?2,?3,?4)
         ON CONFLICT(provider) DO UPDATE SET
            windows_json = excluded.windows_json, error = excluded.error, refreshed_at = excluded.refreshed_at",
        params![row.provider, row.windows_json, row.error, row.refreshed_at],
    )?;
    Ok(())
}

pub fn list_cli_usage_cache(db: &Database) -> Result<Vec<CliUsageCacheRow>, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare("SELECT provider, windows_json, error, refreshed_at FROM cli_usage_cache")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(CliUsageCacheRow {
                provider: row.get(0)?,
                windows_json: row.get(1)?,
                error: row.get(2)?,
                refreshed_at: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

pub fn get_setting(db: &Database, key: &str) -> Result<Option<String>, DbError> {
    let conn = db.conn();
    conn.query_row("SELECT value FROM settings WHERE key = ?1", params![key], |r| r.get(0))
        .optional()
        .map_err(DbError::from)
}

pub fn set_setting(db: &Database, key: &str, value: &str) -> Result<(), DbError> {
    let conn = db.conn();
    conn.execute(
        "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now()],
    )?;
    Ok(())
}

pub fn list_settings(db: &Database) -> Result<Vec<SettingRow>, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare("SELECT key, value, updated_at FROM settings")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SettingRow {
                key: row.get(0)?,
                value: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
