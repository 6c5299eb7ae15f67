mod env_setup;

pub use env_setup::{setup_worker_env, SetupOutcome, SetupStepResult};

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Git command failed: {0}")]
    Git(String),
    #[error("Project path does not exist: {0}")]
    MissingPath(String),
}

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: String,
    pub head: String,
    pub is_bare: bool,
}

fn run_git(args: &[&str], dir: &Path) -> Result<String, WorktreeError> {
    if !dir.exists() {
        return Err(WorktreeError::MissingPath(dir.display().to_string()));
    }

    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| WorktreeError::Git(format!("Failed to run git: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let message = if !stderr.is_empty() { stderr } else { stdout };
        return Err(WorktreeError::Git(if message.is_empty() {
            "Git command failed".to_string()
        } else {
            message
        }));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Directory a worktree for `branch` lands in: a sibling of the project
/// named `<project>--<sanitized-branch>`.
pub fn worktree_path_for(project_path: &Path, branch: &str) -> PathBuf {
    let project_name = project_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "project".to_string());
    let sanitized = branch.replace('/', "-");
    let dir_name = format!("{}--{}", project_name, sanitized);
    project_path
        .parent()
        .map(|p| p.join(&dir_name))
        .unwrap_or_else(|| PathBuf::from(dir_name))
}

/// Create an isolated worktree on a new branch. Returns the worktree path.
pub fn create_worktree(project_path: &Path, branch: &str) -> Result<PathBuf, WorktreeError> {
    let path = worktree_path_for(project_path, branch);
    let path_str = path.to_string_lossy();

    tracing::info!("Creating worktree for branch {} at {}", branch, path_str);
    run_git(
        &["worktree", "add", &path_str, "-b", branch],
        project_path,
    )?;

    Ok(path)
}

/// List worktrees of a repository from porcelain output.
pub fn list_worktrees(project_path: &Path) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let output = run_git(&["worktree", "list", "--porcelain"], project_path)?;
    parse_worktree_list(&output)
}

/// Resolve the parent repository of a worktree: the first entry of
/// `git worktree list` run inside it is the main checkout.
pub fn find_parent_repo(worktree_path: &Path) -> Option<PathBuf> {
    let worktrees = list_worktrees(worktree_path).ok()?;
    worktrees.first().map(|w| PathBuf::from(&w.path))
}

/// Best-effort worktree removal: structured `git worktree remove --force`
/// against the parent repository, falling back to a raw recursive delete.
/// Returns whether the directory is confirmed gone; callers rely on
/// "already gone equals success".
pub fn delete_worktree(worktree_path: &Path, project_path: Option<&Path>) -> bool {
    if !worktree_path.exists() {
        return true;
    }

    let parent = project_path
        .map(Path::to_path_buf)
        .or_else(|| find_parent_repo(worktree_path));

    if let Some(parent) = parent {
        let path_str = worktree_path.to_string_lossy();
        match run_git(&["worktree", "remove", &path_str, "--force"], &parent) {
            Ok(_) => {
                let _ = run_git(&["worktree", "prune"], &parent);
                return !worktree_path.exists();
            }
            Err(e) => {
                tracing::warn!(
                    "Structured worktree removal failed for {}: {}",
                    worktree_path.display(),
                    e
                );
            }
        }
    }

    if let Err(e) = std::fs::remove_dir_all(worktree_path) {
        tracing::warn!("Raw worktree removal failed for {}: {}", worktree_path.display(), e);
    }
    !worktree_path.exists()
}

fn parse_worktree_list(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            if let Some(info) = current.take() {
                worktrees.push(info);
            }
            continue;
        }

        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(info) = current.take() {
                worktrees.push(info);
            }
            current = Some(WorktreeInfo {
                path: path.to_string(),
                branch: String::new(),
                head: String::new(),
                is_bare: false,
            });
            continue;
        }

        let entry = current
            .as_mut()
            .ok_or_else(|| WorktreeError::Git(format!("Unexpected worktree output: {}", line)))?;

        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = branch
                .strip_prefix("refs/heads/")
                .unwrap_or(branch)
                .to_string();
        } else if line == "bare" {
            entry.is_bare = true;
        } else if line == "detached" && entry.branch.is_empty() {
            entry.branch = "detached".to_string();
        }
    }

    if let Some(info) = current.take() {
        worktrees.push(info);
    }

    Ok(worktrees)
}
