use rusqlite::Connection;

use super::DbError;

/// Statements that create the baseline schema. Safe to re-run: every
/// `CREATE TABLE`/`CREATE INDEX` is `IF NOT EXISTS`.
const BASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS departments (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    name_ko     TEXT NOT NULL,
    icon        TEXT,
    color       TEXT,
    sort_order  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS agents (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL,
    name_ko           TEXT NOT NULL,
    department_id     TEXT REFERENCES departments(id),
    role              TEXT NOT NULL DEFAULT 'junior',
    cli_provider      TEXT,
    status            TEXT NOT NULL DEFAULT 'idle',
    current_task_id   TEXT,
    avatar_emoji      TEXT,
    personality       TEXT,
    stats_tasks_done  INTEGER NOT NULL DEFAULT 0,
    stats_xp          INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id                  TEXT PRIMARY KEY,
    title               TEXT NOT NULL,
    description         TEXT,
    department_id       TEXT REFERENCES departments(id),
    assigned_agent_id   TEXT REFERENCES agents(id),
    status              TEXT NOT NULL DEFAULT 'inbox',
    priority            INTEGER NOT NULL DEFAULT 0,
    task_type           TEXT,
    project_path        TEXT,
    result              TEXT,
    started_at          TEXT,
    completed_at        TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS subtasks (
    id                    TEXT PRIMARY KEY,
    task_id               TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    title                 TEXT NOT NULL,
    description           TEXT,
    status                TEXT NOT NULL DEFAULT 'pending',
    assigned_agent_id     TEXT REFERENCES agents(id),
    blocked_reason        TEXT,
    cli_tool_use_id       TEXT,
    target_department_id  TEXT REFERENCES departments(id),
    delegated_task_id     TEXT REFERENCES tasks(id),
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY,
    sender_type     TEXT NOT NULL,
    sender_id       TEXT,
    receiver_type   TEXT NOT NULL,
    receiver_id     TEXT,
    content         TEXT NOT NULL,
    message_type    TEXT NOT NULL DEFAULT 'chat',
    task_id         TEXT REFERENCES tasks(id),
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    kind        TEXT NOT NULL,
    message     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS meeting_minutes (
    id            TEXT PRIMARY KEY,
    task_id       TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    meeting_type  TEXT NOT NULL,
    round         INTEGER NOT NULL DEFAULT 1,
    title         TEXT NOT NULL,
    status        TEXT NOT NULL DEFAULT 'in_progress',
    started_at    TEXT NOT NULL,
    completed_at  TEXT
);

CREATE TABLE IF NOT EXISTS meeting_minute_entries (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    meeting_id          TEXT NOT NULL REFERENCES meeting_minutes(id) ON DELETE CASCADE,
    seq                 INTEGER NOT NULL,
    speaker_agent_id    TEXT,
    speaker_name        TEXT NOT NULL,
    speaker_department  TEXT,
    speaker_role        TEXT,
    message_type        TEXT NOT NULL,
    content             TEXT NOT NULL,
    created_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS oauth_credentials (
    provider        TEXT PRIMARY KEY,
    source          TEXT NOT NULL,
    email           TEXT,
    scope           TEXT,
    expires_at      TEXT,
    encrypted_data  TEXT,
    access_token    TEXT,
    refresh_token   TEXT,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS oauth_states (
    id            TEXT PRIMARY KEY,
    provider      TEXT NOT NULL,
    verifier      TEXT NOT NULL,
    redirect_to   TEXT,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cli_usage_cache (
    provider      TEXT PRIMARY KEY,
    windows_json  TEXT NOT NULL,
    error         TEXT,
    refreshed_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agents_department ON agents(department_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_department ON tasks(department_id);
CREATE INDEX IF NOT EXISTS idx_tasks_agent ON tasks(assigned_agent_id);
CREATE INDEX IF NOT EXISTS idx_subtasks_task ON subtasks(task_id);
CREATE INDEX IF NOT EXISTS idx_subtasks_delegated ON subtasks(delegated_task_id);
CREATE INDEX IF NOT EXISTS idx_messages_receiver ON messages(receiver_type, receiver_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_task ON messages(task_id);
CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(task_id, id);
CREATE INDEX IF NOT EXISTS idx_meeting_minutes_task ON meeting_minutes(task_id);
CREATE INDEX IF NOT EXISTS idx_meeting_entries_meeting ON meeting_minute_entries(meeting_id, seq);
"#;

/// Columns added after the baseline schema. Each is attempted
/// unconditionally; SQLite's "duplicate column name" error is swallowed so
/// the same list can be replayed on every boot without a version table.
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    (
        "agents",
        "ALTER TABLE agents ADD COLUMN break_until TEXT",
    ),
    (
        "tasks",
        "ALTER TABLE tasks ADD COLUMN stop_requested INTEGER NOT NULL DEFAULT 0",
    ),
];

pub(super) fn run_migrations(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(BASE_SCHEMA)
        .map_err(|e| DbError::Migration(format!("base schema: {e}")))?;

    for (table, sql) in ADDITIVE_COLUMNS {
        match conn.execute_batch(sql) {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(_, Some(msg)))
                if msg.contains("duplicate column name") => {}
            Err(e) => {
                return Err(DbError::Migration(format!(
                    "additive column on {table}: {e}"
                )))
            }
        }
    }

    Ok(())
}
