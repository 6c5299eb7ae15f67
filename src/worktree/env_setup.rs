use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

/// Outcome of one environment-setup step.
#[derive(Debug, Clone)]
pub struct SetupStepResult {
    pub step: String,
    pub success: bool,
    pub detail: String,
}

/// Aggregated setup result: per-step log plus an overall success flag.
/// Non-blocking steps (env-file copies) are recorded but never flip the
/// overall flag; dependency installs and declared setup scripts do.
#[derive(Debug, Clone)]
pub struct SetupOutcome {
    pub success: bool,
    pub steps: Vec<SetupStepResult>,
}

impl SetupOutcome {
    fn record(&mut self, step: &str, success: bool, detail: impl Into<String>, blocking: bool) {
        if blocking && !success {
            self.success = false;
        }
        self.steps.push(SetupStepResult {
            step: step.to_string(),
            success,
            detail: detail.into(),
        });
    }
}

/// Prepare a fresh worktree for a worker.
///
/// With declared setup scripts, each is run through a shell in the worktree
/// with `$ROOT_WORKTREE_PATH`, `$WORKTREE_PATH` and `$PORT` substituted.
/// Otherwise: copy non-example `.env*` files from the root checkout, then
/// run the detected package manager's install when a `package.json` exists.
pub async fn setup_worker_env(
    root: &Path,
    worktree: &Path,
    port: Option<u16>,
    setup_scripts: &[String],
) -> SetupOutcome {
    let mut outcome = SetupOutcome {
        success: true,
        steps: Vec::new(),
    };

    if !setup_scripts.is_empty() {
        for script in setup_scripts {
            let rendered = substitute(script, root, worktree, port);
            let result = run_shell(&rendered, worktree, port).await;
            match result {
                Ok(()) => outcome.record(&rendered, true, "", true),
                Err(detail) => {
                    tracing::warn!("Setup script failed in {}: {}", worktree.display(), detail);
                    outcome.record(&rendered, false, detail, true);
                }
            }
        }
        return outcome;
    }

    copy_env_files(root, worktree, &mut outcome);

    if worktree.join("package.json").exists() {
        let install = detect_install_command(worktree);
        match run_shell(install, worktree, port).await {
            Ok(()) => outcome.record(install, true, "", true),
            Err(detail) => {
                tracing::warn!("Dependency install failed in {}: {}", worktree.display(), detail);
                outcome.record(install, false, detail, true);
            }
        }
    }

    outcome
}

fn substitute(script: &str, root: &Path, worktree: &Path, port: Option<u16>) -> String {
    let mut rendered = script
        .replace("$ROOT_WORKTREE_PATH", &root.to_string_lossy())
        .replace("$WORKTREE_PATH", &worktree.to_string_lossy());
    if let Some(port) = port {
        rendered = rendered.replace("$PORT", &port.to_string());
    }
    rendered
}

/// Copy `.env*` files that are not templates (`.example`, `.sample`, `.template`).
fn copy_env_files(root: &Path, worktree: &Path, outcome: &mut SetupOutcome) {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            outcome.record("copy .env files", false, e.to_string(), false);
            return;
        }
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if !name.starts_with(".env") {
            continue;
        }
        let lower = name.to_lowercase();
        if lower.ends_with(".example") || lower.ends_with(".sample") || lower.ends_with(".template")
        {
            continue;
        }
        let step = format!("copy {}", name);
        match std::fs::copy(entry.path(), worktree.join(&file_name)) {
            Ok(_) => outcome.record(&step, true, "", false),
            Err(e) => outcome.record(&step, false, e.to_string(), false),
        }
    }
}

/// Lockfile-based package manager detection, most specific first.
fn detect_install_command(dir: &Path) -> &'static str {
    if dir.join("bun.lockb").exists() || dir.join("bun.lock").exists() {
        "bun install"
    } else if dir.join("pnpm-lock.yaml").exists() {
        "pnpm install"
    } else if dir.join("yarn.lock").exists() {
        "yarn install"
    } else {
        "npm install"
    }
}

async fn run_shell(command: &str, cwd: &Path, port: Option<u16>) -> Result<(), String> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(port) = port {
        cmd.env("PORT", port.to_string());
    }

    let output = cmd.output().await.map_err(|e| e.to_string())?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(if stderr.is_empty() {
            format!("exited with {:?}", output.status.code())
        } else {
            stderr
        })
    }
}
