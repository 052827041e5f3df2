use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Metadata for a single task's isolated worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    /// Absolute path to the worktree directory:
    /// `<projectPath>/.climpire-worktrees/<shortId>`.
    pub path: PathBuf,
    pub branch: String,
    pub project_path: PathBuf,
    /// The branch HEAD pointed to when the worktree was created.
    pub base_branch: Option<String>,
}

/// Result of merging a worktree branch back to the base branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub success: bool,
    pub strategy: MergeStrategy,
    pub message: String,
    /// Files that conflicted (empty if merge succeeded or was a no-op).
    pub conflicted_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    NothingToMerge,
    Merged,
    Conflict,
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to create worktree: {0}")]
    Create(String),
    #[error("git command failed: {0}")]
    Git(String),
    #[error("worktree not found for task: {0}")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// WorktreeManager -- thread-safe registry of active task worktrees
// ---------------------------------------------------------------------------

/// Tracks the one active worktree per task. Held in the Orchestrator behind
/// an `Arc` (§3 Ownership: `taskWorktrees`).
pub struct WorktreeManager {
    active: Mutex<HashMap<String, WorktreeInfo>>,
}

impl Default for WorktreeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WorktreeManager {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, task_id: &str) -> Option<WorktreeInfo> {
        self.active
            .lock()
            .expect("worktree manager mutex poisoned")
            .get(task_id)
            .cloned()
    }

    /// `createWorktree(projectPath, taskId, agentName)` (§4.4). Returns
    /// `Ok(None)` when `project_path` is not under version control — the
    /// task then runs directly in `project_path`.
    pub fn create_worktree(
        &self,
        project_path: &Path,
        task_id: &str,
    ) -> Result<Option<WorktreeInfo>, WorktreeError> {
        if let Some(existing) = self.get(task_id) {
            if existing.path.exists() {
                return Ok(Some(existing));
            }
        }

        if !project_path.join(".git").exists() {
            return Ok(None);
        }

        let short_id = short_task_id(task_id);
        let branch = format!("climpire/{short_id}");
        let target = project_path.join(".climpire-worktrees").join(&short_id);
        let base_branch = current_branch(project_path);

        if target.exists() {
            let info = WorktreeInfo {
                path: target,
                branch,
                project_path: project_path.to_path_buf(),
                base_branch,
            };
            self.active
                .lock()
                .expect("worktree manager mutex poisoned")
                .insert(task_id.to_string(), info.clone());
            return Ok(Some(info));
        }

        std::fs::create_dir_all(target.parent().expect("target has a parent"))?;
        create_git_worktree(project_path, &target, &branch)?;

        let info = WorktreeInfo {
            path: target,
            branch,
            project_path: project_path.to_path_buf(),
            base_branch,
        };
        self.active
            .lock()
            .expect("worktree manager mutex poisoned")
            .insert(task_id.to_string(), info.clone());
        Ok(Some(info))
    }

    /// `mergeWorktree` (§4.4): stat-only diff check, then a no-fast-forward
    /// merge with conflict detection via unmerged-paths listing rather than
    /// error-message parsing.
    pub fn merge_worktree(&self, task_id: &str) -> Result<MergeResult, WorktreeError> {
        let info = self
            .get(task_id)
            .ok_or_else(|| WorktreeError::NotFound(task_id.to_string()))?;

        auto_commit_worktree(&info.path)?;

        let base = info.base_branch.as_deref().unwrap_or("HEAD");
        let range = format!("{base}...{}", info.branch);
        let stat = run_git_command(&info.project_path, &["diff", "--stat", &range]).unwrap_or_default();
        if stat.trim().is_empty() {
            return Ok(MergeResult {
                success: true,
                strategy: MergeStrategy::NothingToMerge,
                message: "nothing to merge".to_string(),
                conflicted_files: vec![],
            });
        }

        let message = format!("climpire: merge {}", info.branch);
        let merge_output = Command::new("git")
            .arg("-C")
            .arg(&info.project_path)
            .args(["merge", "--no-ff", "--no-edit", "-m", &message, &info.branch])
            .env("GIT_AUTHOR_NAME", "Climpire")
            .env("GIT_AUTHOR_EMAIL", "climpire@local")
            .env("GIT_COMMITTER_NAME", "Climpire")
            .env("GIT_COMMITTER_EMAIL", "climpire@local")
            .output()
            .map_err(|e| WorktreeError::Git(format!("merge failed: {e}")))?;

        if merge_output.status.success() {
            return Ok(MergeResult {
                success: true,
                strategy: MergeStrategy::Merged,
                message: format!("merged {}", info.branch),
                conflicted_files: vec![],
            });
        }

        let conflicted = collect_conflict_files(&info.project_path);
        let _ = run_git_command(&info.project_path, &["merge", "--abort"]);

        Ok(MergeResult {
            success: false,
            strategy: MergeStrategy::Conflict,
            message: format!(
                "merge of {} had {} conflict(s) -- aborted",
                info.branch,
                conflicted.len()
            ),
            conflicted_files: conflicted,
        })
    }

    /// `cleanupWorktree` (§4.4): removes the worktree registration, falling
    /// back to a manual directory remove + `git worktree prune` if the git
    /// command itself fails, then deletes the branch.
    pub fn cleanup_worktree(&self, task_id: &str) -> Result<(), WorktreeError> {
        let info = self
            .active
            .lock()
            .expect("worktree manager mutex poisoned")
            .remove(task_id);

        let Some(info) = info else { return Ok(()) };

        let removed = run_git_command(
            &info.project_path,
            &["worktree", "remove", "--force", &info.path.to_string_lossy()],
        );
        if removed.is_err() {
            if info.path.exists() {
                let _ = std::fs::remove_dir_all(&info.path);
            }
            let _ = run_git_command(&info.project_path, &["worktree", "prune"]);
        }

        let _ = run_git_command(&info.project_path, &["branch", "-D", &info.branch]);
        Ok(())
    }

    /// `rollbackTaskWorktree(reason)` (§4.4): reads the diff summary before
    /// the worktree disappears, then cleans up unconditionally. Invoked on
    /// stop, failure, and shutdown. Never panics on a missing worktree.
    pub fn rollback_task_worktree(&self, task_id: &str, reason: &str) -> (String, Result<(), WorktreeError>) {
        let summary = self.worktree_diff_summary(task_id);
        tracing::info!(task_id, reason, "rolling back task worktree");
        (summary, self.cleanup_worktree(task_id))
    }

    /// `getWorktreeDiffSummary` (§4.4): never throws — returns an
    /// empty-change or read-failure marker instead of propagating errors.
    pub fn worktree_diff_summary(&self, task_id: &str) -> String {
        let Some(info) = self.get(task_id) else {
            return "no worktree".to_string();
        };
        let base = info.base_branch.as_deref().unwrap_or("HEAD");
        let range = format!("{base}...{}", info.branch);
        match run_git_command(&info.project_path, &["diff", "--stat", &range]) {
            Ok(stat) if stat.trim().is_empty() => "no changes".to_string(),
            Ok(stat) => stat.trim().to_string(),
            Err(_) => "diff unavailable".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Git helpers
// ---------------------------------------------------------------------------

/// First 8 hex chars of the task id (uuid v4 ids are already hex before the
/// first hyphen, so no stripping is needed).
fn short_task_id(task_id: &str) -> String {
    task_id.chars().take(8).collect()
}

fn current_branch(project_path: &Path) -> Option<String> {
    let output = run_git_command(project_path, &["rev-parse", "--abbrev-ref", "HEAD"]).ok()?;
    let branch = output.trim().to_string();
    if branch.is_empty() || branch == "HEAD" {
        None
    } else {
        Some(branch)
    }
}

fn create_git_worktree(project_path: &Path, target: &Path, branch: &str) -> Result<(), WorktreeError> {
    let _ = run_git_command(project_path, &["branch", "-D", branch]);

    let output = Command::new("git")
        .arg("-C")
        .arg(project_path)
        .args(["worktree", "add", "-b", branch])
        .arg(target)
        .arg("HEAD")
        .output()
        .map_err(|e| WorktreeError::Git(format!("failed to run git worktree add: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(WorktreeError::Create(format!(
            "git worktree add -b {branch} failed: {stderr}"
        )))
    }
}

fn auto_commit_worktree(worktree_path: &Path) -> Result<(), WorktreeError> {
    let _ = run_git_command(worktree_path, &["add", "-A"]);

    let status = run_git_command(worktree_path, &["status", "--porcelain"]).unwrap_or_default();
    if status.trim().is_empty() {
        return Ok(());
    }

    let output = Command::new("git")
        .arg("-C")
        .arg(worktree_path)
        .args(["commit", "-m", "climpire: agent work", "--allow-empty"])
        .env("GIT_AUTHOR_NAME", "Climpire")
        .env("GIT_AUTHOR_EMAIL", "climpire@local")
        .env("GIT_COMMITTER_NAME", "Climpire")
        .env("GIT_COMMITTER_EMAIL", "climpire@local")
        .output()
        .map_err(|e| WorktreeError::Git(format!("auto-commit failed: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.contains("nothing to commit") {
            tracing::warn!("auto-commit in worktree had issues: {stderr}");
        }
    }

    Ok(())
}

/// Unmerged paths from a failed merge — the only reliable conflict signal,
/// never parsed out of git's stderr text (§4.4).
fn collect_conflict_files(project_path: &Path) -> Vec<String> {
    match run_git_command(project_path, &["diff", "--name-only", "--diff-filter=U"]) {
        Ok(text) => text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .collect(),
        Err(_) => vec![],
    }
}

fn run_git_command(cwd: &Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(cwd)
        .args(args)
        .output()
        .map_err(|e| format!("failed to execute git: {e}"))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_task_id_takes_first_eight_chars() {
        assert_eq!(short_task_id("abcdef12-3456-7890-abcd-ef1234567890"), "abcdef12");
    }

    #[test]
    fn branch_name_follows_climpire_scheme() {
        let short = short_task_id("deadbeef-0000-0000-0000-000000000000");
        assert_eq!(format!("climpire/{short}"), "climpire/deadbeef");
    }

    #[test]
    fn diff_summary_for_unknown_task_reports_no_worktree() {
        let manager = WorktreeManager::new();
        assert_eq!(manager.worktree_diff_summary("missing-task"), "no worktree");
    }

    #[test]
    fn create_worktree_on_non_repo_returns_none() {
        let manager = WorktreeManager::new();
        let dir = tempfile::tempdir().unwrap();
        let result = manager.create_worktree(dir.path(), "task-1").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn create_and_merge_worktree_roundtrip() {
        let manager = WorktreeManager::new();
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path();

        run_git_command(project, &["init", "-q"]).unwrap();
        run_git_command(project, &["config", "user.email", "t@example.com"]).unwrap();
        run_git_command(project, &["config", "user.name", "Test"]).unwrap();
        std::fs::write(project.join("README.md"), "hello\n").unwrap();
        run_git_command(project, &["add", "-A"]).unwrap();
        run_git_command(project, &["commit", "-q", "-m", "initial"]).unwrap();

        let task_id = "11112222-3333-4444-5555-666677778888";
        let info = manager
            .create_worktree(project, task_id)
            .unwrap()
            .expect("project is a repo");
        assert!(info.path.exists());
        assert_eq!(info.branch, "climpire/11112222");

        std::fs::write(info.path.join("new_file.txt"), "added by agent\n").unwrap();

        let merge = manager.merge_worktree(task_id).unwrap();
        assert!(merge.success);
        assert_eq!(merge.strategy, MergeStrategy::Merged);
        assert!(project.join("new_file.txt").exists());

        manager.cleanup_worktree(task_id).unwrap();
        assert!(manager.get(task_id).is_none());
    }
}
