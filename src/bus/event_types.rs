//! Event type constants and the immediate-vs-batched flush policy (§4.3).

use super::event_bus::BusEvent;

pub const EVENT_TASK_UPDATE: &str = "task_update";
pub const EVENT_AGENT_STATUS: &str = "agent_status";
pub const EVENT_NEW_MESSAGE: &str = "new_message";
pub const EVENT_ANNOUNCEMENT: &str = "announcement";
pub const EVENT_SUBTASK_UPDATE: &str = "subtask_update";
pub const EVENT_CLI_OUTPUT: &str = "cli_output";
pub const EVENT_CLI_USAGE_UPDATE: &str = "cli_usage_update";
pub const EVENT_CROSS_DEPT_DELIVERY: &str = "cross_dept_delivery";
pub const EVENT_CEO_OFFICE_CALL: &str = "ceo_office_call";
pub const EVENT_MESSAGES_CLEARED: &str = "messages_cleared";
pub const EVENT_CONNECTED: &str = "connected";

/// Events flushed to WebSocket clients immediately instead of on the 100ms
/// batch tick: task/agent status changes and raw CLI output, which the UI
/// renders as a live log and must not feel delayed.
pub fn should_flush_immediately(event: &BusEvent) -> bool {
    matches!(
        event.event_type.as_str(),
        EVENT_TASK_UPDATE | EVENT_AGENT_STATUS | EVENT_CLI_OUTPUT
    )
}
