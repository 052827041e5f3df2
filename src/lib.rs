//! Climpire backend library.
//!
//! Architecture:
//! - `api`: axum HTTP/WebSocket surface (§6)
//! - `runtime`: task orchestration, delegation, meetings, provider adapters
//! - `db`: SQLite store and migrations
//! - `bus`: event bus and WebSocket fan-out
//! - `core`: shared domain types (departments, roles, locale)
//! - `vault`: at-rest encryption for OAuth tokens
//! - `config`: environment-derived configuration
//! - `error`: the unified `AppError` type and its HTTP mapping

pub mod api;
pub mod bus;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod runtime;
pub mod vault;
