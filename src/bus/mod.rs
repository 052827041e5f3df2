//! Event system for real-time server-client communication.
//!
//! Events flow from orchestrator/runtime code → `EventBus` → one
//! `bus::ws::handle_socket` task per WebSocket connection:
//! - `EventBus`: in-memory broadcast channel for immediate distribution
//! - `ws::handle_socket`: per-connection batching (100ms/50 events), with
//!   `task_update`/`agent_status`/`cli_output` flushed instantly
//! - `event_types`: the fixed vocabulary of wire event types and the
//!   immediate-flush policy

mod event_bus;
pub mod event_types;
pub mod ws;

pub use event_bus::{BusEvent, EventBus, WireFrame};
