//! Database layer for persistent storage.
//!
//! This module provides:
//! - SQLite database management, single-writer behind a mutex
//! - Additive, idempotent schema migrations (no version table)
//! - Query functions for every entity in the data model
//! - Error types for database failures
//!
//! # Schema
//!
//! Core tables:
//! - `departments` / `agents`: the virtual company roster
//! - `tasks` / `subtasks`: work items and their CLI-stream-detected pieces
//! - `messages` / `task_logs`: chat history and per-task run logs
//! - `meeting_minutes` / `meeting_minute_entries`: recorded meeting turns
//! - `oauth_credentials` / `oauth_states`: encrypted token storage
//! - `cli_usage_cache` / `settings`: quota snapshots and key-value config
//!
//! See `migrations.rs` for the full schema.

mod migrations;
pub mod queries;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("not found: {0}")]
    NotFound(String),
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database file at `path`, enable WAL mode, and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    #[cfg(test)]
    /// Open an in-memory database for tests.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=3000;",
        )?;
        migrations::run_migrations(&conn)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        queries::seed_departments_and_agents(&db)?;
        Ok(db)
    }

    /// Acquire a lock on the connection for queries.
    pub fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }
}
