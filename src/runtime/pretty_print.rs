//! Stream-JSON pretty-printer (§4.12): turns a buffer of newline-delimited
//! provider event JSON into readable text. Non-JSON input passes through
//! unchanged.

use serde_json::Value;

/// Render a full NDJSON buffer as readable text: meta lines first, then the
/// stitched assistant content with stray newlines collapsed.
pub fn pretty_print(buffer: &str) -> String {
    let mut meta: Vec<String> = Vec::new();
    let mut content: Vec<String> = Vec::new();
    let mut saw_any_json = false;

    for line in buffer.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        saw_any_json = true;
        render_event(&value, &mut meta, &mut content);
    }

    if !saw_any_json {
        return buffer.to_string();
    }

    let mut out = String::new();
    for line in &meta {
        out.push_str(line);
        out.push('\n');
    }
    if !meta.is_empty() && !content.is_empty() {
        out.push('\n');
    }
    out.push_str(&collapse_newlines(&content.join("")));
    out
}

fn render_event(value: &Value, meta: &mut Vec<String>, content: &mut Vec<String>) {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or("");

    match kind {
        // Claude stream events
        "stream_event" => {
            if let Some(delta) = value
                .pointer("/event/delta/text")
                .or_else(|| value.pointer("/delta/text"))
                .and_then(Value::as_str)
            {
                content.push(delta.to_string());
            }
        }
        "result" => {
            if let Some(text) = value.get("result").and_then(Value::as_str) {
                content.push(text.to_string());
            }
        }
        // Gemini
        "message" => {
            if value.get("role").and_then(Value::as_str) == Some("assistant") {
                if let Some(text) = value.get("content").and_then(Value::as_str) {
                    content.push(text.to_string());
                }
            }
            if let Some(tool_calls) = value.get("tool_calls").and_then(Value::as_array) {
                for call in tool_calls {
                    let name = call.get("name").and_then(Value::as_str).unwrap_or("tool");
                    let params = call.get("parameters").map(|p| p.to_string()).unwrap_or_default();
                    meta.push(format!("[tool: {name}] {params}"));
                }
            }
            if let Some(status) = value.pointer("/tool_result/status").and_then(Value::as_str) {
                if status != "ok" {
                    meta.push(format!("[result: {status}]"));
                }
            }
        }
        // Codex
        "thread.started" => {
            if let Some(id) = value.get("thread_id").or_else(|| value.get("id")).and_then(Value::as_str) {
                meta.push(format!("[thread] {id}"));
            }
        }
        "item.completed" => {
            let item_type = value.pointer("/item/type").and_then(Value::as_str).unwrap_or("");
            match item_type {
                "agent_message" => {
                    if let Some(text) = value.pointer("/item/text").and_then(Value::as_str) {
                        content.push(text.to_string());
                    }
                }
                "reasoning" => {
                    if let Some(text) = value.pointer("/item/text").and_then(Value::as_str) {
                        meta.push(format!("[reasoning] {text}"));
                    }
                }
                "tool_call" => {
                    let name = value.pointer("/item/tool").and_then(Value::as_str).unwrap_or("tool");
                    let args = value.pointer("/item/args").map(|a| a.to_string()).unwrap_or_default();
                    let prefix: String = args.chars().take(120).collect();
                    meta.push(format!("[tool: {name}] {prefix}"));
                }
                "tool_output" => {
                    if let Some(text) = value.pointer("/item/output").and_then(Value::as_str) {
                        let truncated: String = text.chars().take(200).collect();
                        meta.push(format!("[tool_output] {truncated}"));
                    }
                }
                "collab_tool_call" => {
                    let tool = value.pointer("/item/tool").and_then(Value::as_str).unwrap_or("");
                    match tool {
                        "spawn_agent" => meta.push("[spawn_agent]".to_string()),
                        "close_agent" => meta.push("[agent_done]".to_string()),
                        _ => {}
                    }
                }
                _ => {}
            }
        }
        "turn.completed" => {
            if let Some(usage) = value.get("usage") {
                meta.push(format!("[usage] {usage}"));
            }
        }
        _ => {}
    }
}

fn collapse_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_newline = false;
    for ch in text.chars() {
        if ch == '\n' {
            if last_was_newline {
                continue;
            }
            last_was_newline = true;
        } else {
            last_was_newline = false;
        }
        out.push(ch);
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_through_non_json_unchanged() {
        assert_eq!(pretty_print("just plain text"), "just plain text");
    }

    #[test]
    fn extracts_claude_result_text() {
        let buf = r#"{"type":"result","result":"All done."}"#;
        assert_eq!(pretty_print(buf), "All done.");
    }

    #[test]
    fn extracts_claude_stream_deltas_in_order() {
        let buf = "{\"type\":\"stream_event\",\"delta\":{\"text\":\"Hel\"}}\n{\"type\":\"stream_event\",\"delta\":{\"text\":\"lo\"}}";
        assert_eq!(pretty_print(buf), "Hello");
    }

    #[test]
    fn renders_codex_thread_and_agent_message() {
        let buf = "{\"type\":\"thread.started\",\"thread_id\":\"abc123\"}\n{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"Working on it.\"}}";
        let out = pretty_print(buf);
        assert!(out.contains("[thread] abc123"));
        assert!(out.contains("Working on it."));
    }

    #[test]
    fn renders_codex_tool_call_meta() {
        let buf = r#"{"type":"item.completed","item":{"type":"tool_call","tool":"shell","args":{"cmd":"ls"}}}"#;
        assert!(pretty_print(buf).contains("[tool: shell]"));
    }
}
