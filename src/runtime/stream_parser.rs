//! Subtask-lifecycle extraction from NDJSON-ish provider output (§4.5).
//!
//! Emits `SubtaskEvent`s as lines arrive; the caller (Child Runner /
//! orchestrator) turns these into Store writes and bus events.

use std::collections::HashMap;

use serde_json::Value;

const SCAN_BUFFER_CAP: usize = 2048;

#[derive(Debug, Clone, PartialEq)]
pub enum SubtaskEvent {
    Created { tool_use_id: String, title: String },
    Completed { tool_use_id: String },
}

/// Per-task parser state, since Codex multi-agent correlation needs a
/// spawn-item-id → receiver-thread-id map that spans multiple lines.
#[derive(Default)]
pub struct StreamParser {
    /// Codex: spawn_agent item id -> receiver thread id, filled in on
    /// `item.completed` of `spawn_agent`; consulted on `close_agent`.
    codex_spawn_to_thread: HashMap<String, String>,
    /// Gemini/HTTP: bounded trailing buffer scanned for plan JSON blobs.
    scan_buffer: String,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line of provider output, already known to come from
    /// `provider`. Returns zero or more subtask lifecycle events.
    pub fn feed_line(&mut self, provider: &str, line: &str) -> Vec<SubtaskEvent> {
        match provider {
            "claude" => self.feed_claude(line),
            "codex" => self.feed_codex(line),
            _ => self.feed_plain_text(line),
        }
    }

    fn feed_claude(&mut self, line: &str) -> Vec<SubtaskEvent> {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return vec![];
        };
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
        let mut events = Vec::new();

        if kind == "tool_use" && value.get("tool").and_then(Value::as_str) == Some("Task") {
            if let Some(id) = value.get("id").and_then(Value::as_str) {
                let title = value
                    .pointer("/input/description")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| {
                        value
                            .pointer("/input/prompt")
                            .and_then(Value::as_str)
                            .map(|p| p.chars().take(100).collect())
                    })
                    .unwrap_or_else(|| "subtask".to_string());
                events.push(SubtaskEvent::Created {
                    tool_use_id: id.to_string(),
                    title,
                });
            }
        }

        if kind == "tool_result" && value.get("tool").and_then(Value::as_str) == Some("Task") {
            if let Some(id) = value.get("id").and_then(Value::as_str) {
                events.push(SubtaskEvent::Completed {
                    tool_use_id: id.to_string(),
                });
            }
        }

        events
    }

    fn feed_codex(&mut self, line: &str) -> Vec<SubtaskEvent> {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return vec![];
        };
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
        let mut events = Vec::new();

        if kind == "item.started" {
            let item_type = value.pointer("/item/type").and_then(Value::as_str).unwrap_or("");
            let tool = value.pointer("/item/tool").and_then(Value::as_str).unwrap_or("");
            if item_type == "collab_tool_call" && tool == "spawn_agent" {
                if let Some(id) = value.pointer("/item/id").and_then(Value::as_str) {
                    let title = value
                        .pointer("/item/args/task")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| "sub-agent".to_string());
                    events.push(SubtaskEvent::Created {
                        tool_use_id: id.to_string(),
                        title,
                    });
                }
            }
        }

        if kind == "item.completed" {
            let item_type = value.pointer("/item/type").and_then(Value::as_str).unwrap_or("");
            let tool = value.pointer("/item/tool").and_then(Value::as_str).unwrap_or("");

            if item_type == "collab_tool_call" && tool == "spawn_agent" {
                let spawn_id = value.pointer("/item/id").and_then(Value::as_str);
                let thread_id = value.pointer("/item/result/thread_id").and_then(Value::as_str);
                if let (Some(spawn_id), Some(thread_id)) = (spawn_id, thread_id) {
                    self.codex_spawn_to_thread
                        .insert(thread_id.to_string(), spawn_id.to_string());
                }
            }

            if item_type == "collab_tool_call" && tool == "close_agent" {
                if let Some(thread_id) = value.pointer("/item/args/thread_id").and_then(Value::as_str) {
                    if let Some(spawn_id) = self.codex_spawn_to_thread.remove(thread_id) {
                        events.push(SubtaskEvent::Completed { tool_use_id: spawn_id });
                    }
                }
            }
        }

        events
    }

    /// Gemini/HTTP agents emit plain text with embedded plan-contract JSON
    /// (§4.8 step 3): `{"subtasks":[...]}` to create, `{"subtask_done":
    /// "..."}` to complete. Scanned over a bounded trailing buffer since
    /// these blobs can straddle chunk boundaries.
    fn feed_plain_text(&mut self, chunk: &str) -> Vec<SubtaskEvent> {
        self.scan_buffer.push_str(chunk);
        if self.scan_buffer.len() > SCAN_BUFFER_CAP {
            let excess = self.scan_buffer.len() - SCAN_BUFFER_CAP;
            self.scan_buffer.drain(..excess);
        }

        let mut events = Vec::new();

        if let Some(start) = self.scan_buffer.find("{\"subtasks\"") {
            if let Some(parsed) = extract_balanced_json(&self.scan_buffer[start..]) {
                if let Ok(value) = serde_json::from_str::<Value>(&parsed) {
                    if let Some(subtasks) = value.get("subtasks").and_then(Value::as_array) {
                        for (idx, st) in subtasks.iter().enumerate() {
                            let title = st
                                .get("title")
                                .and_then(Value::as_str)
                                .map(str::to_string)
                                .unwrap_or_else(|| format!("subtask {idx}"));
                            events.push(SubtaskEvent::Created {
                                tool_use_id: format!("plan-{idx}"),
                                title,
                            });
                        }
                    }
                }
            }
        }

        if let Some(start) = self.scan_buffer.find("{\"subtask_done\"") {
            if let Some(parsed) = extract_balanced_json(&self.scan_buffer[start..]) {
                if let Ok(value) = serde_json::from_str::<Value>(&parsed) {
                    if let Some(title) = value.get("subtask_done").and_then(Value::as_str) {
                        events.push(SubtaskEvent::Completed {
                            tool_use_id: format!("title:{title}"),
                        });
                    }
                }
            }
        }

        events
    }
}

/// Extract the first balanced `{...}` object starting at `text`'s first
/// byte, tolerant of the object being followed by more text.
fn extract_balanced_json(text: &str) -> Option<String> {
    let mut depth = 0i32;
    for (idx, ch) in text.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[..=idx].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_task_tool_use_creates_subtask() {
        let mut parser = StreamParser::new();
        let line = r#"{"type":"tool_use","tool":"Task","id":"tu_1","input":{"description":"write tests"}}"#;
        let events = parser.feed_line("claude", line);
        assert_eq!(
            events,
            vec![SubtaskEvent::Created {
                tool_use_id: "tu_1".to_string(),
                title: "write tests".to_string()
            }]
        );
    }

    #[test]
    fn claude_task_tool_result_completes_subtask() {
        let mut parser = StreamParser::new();
        let line = r#"{"type":"tool_result","tool":"Task","id":"tu_1"}"#;
        let events = parser.feed_line("claude", line);
        assert_eq!(events, vec![SubtaskEvent::Completed { tool_use_id: "tu_1".to_string() }]);
    }

    #[test]
    fn codex_spawn_then_close_completes_via_thread_map() {
        let mut parser = StreamParser::new();
        let started = r#"{"type":"item.started","item":{"type":"collab_tool_call","tool":"spawn_agent","id":"spawn_1","args":{"task":"refactor module"}}}"#;
        let created = parser.feed_line("codex", started);
        assert_eq!(
            created,
            vec![SubtaskEvent::Created {
                tool_use_id: "spawn_1".to_string(),
                title: "refactor module".to_string()
            }]
        );

        let spawn_completed = r#"{"type":"item.completed","item":{"type":"collab_tool_call","tool":"spawn_agent","id":"spawn_1","result":{"thread_id":"thread_9"}}}"#;
        assert!(parser.feed_line("codex", spawn_completed).is_empty());

        let close = r#"{"type":"item.completed","item":{"type":"collab_tool_call","tool":"close_agent","args":{"thread_id":"thread_9"}}}"#;
        let completed = parser.feed_line("codex", close);
        assert_eq!(completed, vec![SubtaskEvent::Completed { tool_use_id: "spawn_1".to_string() }]);
    }

    #[test]
    fn plain_text_plan_contract_creates_and_completes() {
        let mut parser = StreamParser::new();
        let chunk = r#"Here is my plan: {"subtasks":[{"title":"design schema"},{"title":"write migration"}]} thanks"#;
        let events = parser.feed_line("gemini", chunk);
        assert_eq!(events.len(), 2);

        let done = r#"progress: {"subtask_done":"design schema"} moving on"#;
        let events = parser.feed_line("gemini", done);
        assert_eq!(events, vec![SubtaskEvent::Completed { tool_use_id: "title:design schema".to_string() }]);
    }
}
