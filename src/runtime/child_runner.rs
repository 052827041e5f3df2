//! Child Runner (§4.5): spawns CLI coding agents with provider-specific
//! argv, multiplexes their stdout/stderr to a per-task log file, the Event
//! Bus, and the stream parser, and tears down the whole process tree on
//! stop/timeout.
//!
//! Uses a `tokio::process` spawn + `BufReader::lines()` log-capture task.
//! Process-tree kill shells out to `kill`/`taskkill` the same way
//! `worktree.rs` shells `git`, rather than adding a `libc`/`nix` dependency
//! for the handful of calls that need it.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::bus::{event_types, EventBus};
use crate::runtime::stream_parser::{StreamParser, SubtaskEvent};

#[derive(Debug, Error)]
pub enum ChildRunnerError {
    #[error("provider {0} is served by the HTTP Agent Runner, not the Child Runner")]
    HttpOnlyProvider(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("failed to spawn child process: {0}")]
    Spawn(std::io::Error),
    #[error("failed to open log file: {0}")]
    Log(std::io::Error),
    #[error("no active process for task: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone)]
pub enum ChildRunnerEvent {
    Subtask(SubtaskEvent),
    Exited { code: i32 },
}

/// What the stream parser needs to know to pick a provider-specific parse
/// path; distinct from the argv-building enum since the HTTP runner shares
/// the same parser for Gemini-shaped plain text.
fn parser_label(provider: &str) -> &'static str {
    match provider {
        "claude" => "claude",
        "codex" => "codex",
        _ => "plain",
    }
}

/// Build the exact argv for a CLI provider. `model` and `reasoning_effort`
/// are both optional passthroughs from the task's agent config.
pub fn build_argv(
    provider: &str,
    model: Option<&str>,
    reasoning_effort: Option<&str>,
) -> Result<(&'static str, Vec<String>), ChildRunnerError> {
    match provider {
        "codex" => {
            let mut args = vec!["--enable".to_string(), "multi_agent".to_string()];
            if let Some(m) = model {
                args.push("-m".to_string());
                args.push(m.to_string());
            }
            if let Some(effort) = reasoning_effort {
                args.push("-c".to_string());
                args.push(format!("model_reasoning_effort=\"{effort}\""));
            }
            args.push("--yolo".to_string());
            args.push("exec".to_string());
            args.push("--json".to_string());
            Ok(("codex", args))
        }
        "claude" => {
            let mut args = vec![
                "--dangerously-skip-permissions".to_string(),
                "--print".to_string(),
                "--verbose".to_string(),
                "--output-format=stream-json".to_string(),
                "--include-partial-messages".to_string(),
            ];
            if let Some(m) = model {
                args.push("--model".to_string());
                args.push(m.to_string());
            }
            Ok(("claude", args))
        }
        "gemini" => {
            let mut args = Vec::new();
            if let Some(m) = model {
                args.push("-m".to_string());
                args.push(m.to_string());
            }
            args.push("--yolo".to_string());
            args.push("--output-format=stream-json".to_string());
            Ok(("gemini", args))
        }
        "opencode" => {
            let mut args = vec!["run".to_string()];
            if let Some(m) = model {
                args.push("-m".to_string());
                args.push(m.to_string());
            }
            args.push("--format".to_string());
            args.push("json".to_string());
            Ok(("opencode", args))
        }
        "copilot" | "antigravity" => Err(ChildRunnerError::HttpOnlyProvider(provider.to_string())),
        other => Err(ChildRunnerError::UnknownProvider(other.to_string())),
    }
}

struct ActiveProcess {
    pid: u32,
    child: Arc<Mutex<Child>>,
}

/// Tracks `activeProcesses[taskId]` and owns log-file + bus + stream-parser
/// fan-out for every spawned child.
#[derive(Default)]
pub struct ChildRunner {
    active: Mutex<HashMap<String, ActiveProcess>>,
}

impl ChildRunner {
    pub fn new() -> Self {
        Self { active: Mutex::new(HashMap::new()) }
    }

    pub async fn pid_of(&self, task_id: &str) -> Option<u32> {
        self.active.lock().await.get(task_id).map(|p| p.pid)
    }

    /// Spawn a provider CLI for `task_id`, deliver `prompt` on stdin, and
    /// drive stdout/stderr to the log file, bus, and stream parser until
    /// the process exits. `events_tx` receives subtask lifecycle events
    /// and the final exit code for the orchestrator's completion handler.
    pub async fn spawn(
        self: &Arc<Self>,
        task_id: String,
        provider: &str,
        model: Option<&str>,
        reasoning_effort: Option<&str>,
        project_dir: &Path,
        prompt: &str,
        logs_dir: &Path,
        bus: Arc<EventBus>,
        events_tx: mpsc::UnboundedSender<ChildRunnerEvent>,
    ) -> Result<(), ChildRunnerError> {
        let (binary, args) = build_argv(provider, model, reasoning_effort)?;

        std::fs::create_dir_all(logs_dir).map_err(ChildRunnerError::Log)?;
        let log_path = logs_dir.join(format!("{task_id}.log"));
        let mut log_file = tokio::fs::File::create(&log_path)
            .await
            .map_err(ChildRunnerError::Log)?;

        let mut command = Command::new(binary);
        command
            .args(&args)
            .current_dir(project_dir)
            .env_remove("CLAUDECODE")
            .env_remove("CLAUDE_CODE")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Detach into its own process group so `kill_pid_tree` can
            // signal the whole tree via the negated pgid.
            command.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = command.spawn().map_err(ChildRunnerError::Spawn)?;
        let pid = child.id().unwrap_or(0);

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            let _ = stdin.write_all(prompt.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Arc::new(Mutex::new(child));

        {
            let mut active = self.active.lock().await;
            active.insert(task_id.clone(), ActiveProcess { pid, child: Arc::clone(&child) });
        }

        let label = parser_label(provider);
        let mut parser = StreamParser::new();

        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                handle_line(&task_id, &line, label, &mut parser, &mut log_file, &bus, &events_tx).await;
            }
        }
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                handle_line(&task_id, &line, label, &mut parser, &mut log_file, &bus, &events_tx).await;
            }
        }

        let status = child.lock().await.wait().await;
        let code = status.ok().and_then(|s| s.code()).unwrap_or(1);

        self.active.lock().await.remove(&task_id);
        let _ = events_tx.send(ChildRunnerEvent::Exited { code });
        Ok(())
    }

    /// Terminate the process tree for `task_id`, escalating SIGTERM to
    /// SIGKILL on POSIX or `taskkill /T /F` on Windows. A no-op (not an
    /// error) if the task has no active process.
    pub async fn kill(&self, task_id: &str) -> Result<(), ChildRunnerError> {
        let pid = {
            let active = self.active.lock().await;
            match active.get(task_id) {
                Some(p) => p.pid,
                None => return Ok(()),
            }
        };
        kill_pid_tree(pid).await;
        self.active.lock().await.remove(task_id);
        Ok(())
    }
}

async fn handle_line(
    task_id: &str,
    line: &str,
    label: &str,
    parser: &mut StreamParser,
    log_file: &mut tokio::fs::File,
    bus: &Arc<EventBus>,
    events_tx: &mpsc::UnboundedSender<ChildRunnerEvent>,
) {
    let _ = log_file.write_all(line.as_bytes()).await;
    let _ = log_file.write_all(b"\n").await;

    bus.emit(
        event_types::EVENT_CLI_OUTPUT,
        Some(task_id.to_string()),
        serde_json::json!({ "line": line }),
    );

    for event in parser.feed_line(label, line) {
        let _ = events_tx.send(ChildRunnerEvent::Subtask(event));
    }
}

/// `killPidTree(pid)` — on Windows, synchronous `taskkill /pid <pid> /T
/// /F` with an 8s timeout; on POSIX, SIGTERM to both the process group and
/// the pid, recheck liveness after 1.2s, escalate to SIGKILL if still alive.
pub async fn kill_pid_tree(pid: u32) {
    if pid == 0 {
        return;
    }

    #[cfg(windows)]
    {
        let _ = tokio::time::timeout(
            Duration::from_secs(8),
            tokio::process::Command::new("taskkill")
                .args(["/pid", &pid.to_string(), "/T", "/F"])
                .status(),
        )
        .await;
    }

    #[cfg(unix)]
    {
        let _ = tokio::process::Command::new("kill")
            .args(["-TERM", &format!("-{pid}")])
            .status()
            .await;
        let _ = tokio::process::Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status()
            .await;

        tokio::time::sleep(Duration::from_millis(1200)).await;

        if process_alive(pid).await {
            let _ = tokio::process::Command::new("kill")
                .args(["-KILL", &format!("-{pid}")])
                .status()
                .await;
            let _ = tokio::process::Command::new("kill")
                .args(["-KILL", &pid.to_string()])
                .status()
                .await;
        }
    }
}

/// The one-shot CLI contract shared by the Meeting Engine's turns and the
/// Delegation Engine's direct replies (§4.7/§4.9): a single invocation,
/// stdin delivers the prompt then closes, stdout+stderr are captured to a
/// run-specific log file and returned as a string, and a timeout
/// escalates through `kill_pid_tree` rather than just dropping the child.
pub struct OneShotOutput {
    pub captured: String,
    pub timed_out: bool,
}

#[allow(clippy::too_many_arguments)]
pub async fn run_one_shot(
    provider: &str,
    model: Option<&str>,
    reasoning_effort: Option<&str>,
    project_dir: &Path,
    prompt: &str,
    timeout: Duration,
    logs_dir: &Path,
    run_id: &str,
    stream_task_id: Option<&str>,
    bus: Option<&Arc<EventBus>>,
) -> Result<OneShotOutput, ChildRunnerError> {
    let (binary, args) = build_argv(provider, model, reasoning_effort)?;

    std::fs::create_dir_all(logs_dir).map_err(ChildRunnerError::Log)?;
    let log_path = logs_dir.join(format!("{run_id}.log"));
    let mut log_file = tokio::fs::File::create(&log_path).await.map_err(ChildRunnerError::Log)?;

    let mut command = Command::new(binary);
    command
        .args(&args)
        .current_dir(project_dir)
        .env_remove("CLAUDECODE")
        .env_remove("CLAUDE_CODE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = command.spawn().map_err(ChildRunnerError::Spawn)?;
    let pid = child.id().unwrap_or(0);

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(prompt.as_bytes()).await;
        let _ = stdin.shutdown().await;
    }

    let stdout = child.stdout.take();

    let read_and_wait = async move {
        let mut captured = String::new();
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = log_file.write_all(line.as_bytes()).await;
                let _ = log_file.write_all(b"\n").await;
                if let (Some(stream_task_id), Some(bus)) = (stream_task_id, bus) {
                    bus.emit(
                        event_types::EVENT_CLI_OUTPUT,
                        Some(stream_task_id.to_string()),
                        serde_json::json!({ "line": line }),
                    );
                }
                captured.push_str(&line);
                captured.push('\n');
            }
        }
        let _ = child.wait().await;
        captured
    };

    match tokio::time::timeout(timeout, read_and_wait).await {
        Ok(captured) => Ok(OneShotOutput { captured, timed_out: false }),
        Err(_) => {
            kill_pid_tree(pid).await;
            Ok(OneShotOutput { captured: String::new(), timed_out: true })
        }
    }
}

#[cfg(unix)]
async fn process_alive(pid: u32) -> bool {
    tokio::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codex_argv_matches_spec() {
        let (bin, args) = build_argv("codex", Some("gpt-5-codex"), Some("high")).unwrap();
        assert_eq!(bin, "codex");
        assert_eq!(
            args,
            vec![
                "--enable", "multi_agent", "-m", "gpt-5-codex", "-c",
                "model_reasoning_effort=\"high\"", "--yolo", "exec", "--json"
            ]
        );
    }

    #[test]
    fn claude_argv_omits_model_flag_when_absent() {
        let (bin, args) = build_argv("claude", None, None).unwrap();
        assert_eq!(bin, "claude");
        assert_eq!(
            args,
            vec![
                "--dangerously-skip-permissions", "--print", "--verbose",
                "--output-format=stream-json", "--include-partial-messages"
            ]
        );
    }

    #[test]
    fn gemini_argv_includes_model_when_present() {
        let (_, args) = build_argv("gemini", Some("gemini-2.5-pro"), None).unwrap();
        assert!(args.contains(&"-m".to_string()));
        assert!(args.contains(&"gemini-2.5-pro".to_string()));
    }

    #[test]
    fn opencode_argv_matches_spec() {
        let (bin, args) = build_argv("opencode", None, None).unwrap();
        assert_eq!(bin, "opencode");
        assert_eq!(args, vec!["run", "--format", "json"]);
    }

    #[test]
    fn http_only_providers_are_rejected() {
        assert!(matches!(build_argv("copilot", None, None), Err(ChildRunnerError::HttpOnlyProvider(_))));
        assert!(matches!(build_argv("antigravity", None, None), Err(ChildRunnerError::HttpOnlyProvider(_))));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(matches!(build_argv("bogus", None, None), Err(ChildRunnerError::UnknownProvider(_))));
    }
}
