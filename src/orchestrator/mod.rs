mod naming;

pub use naming::{branch_name_for_task, session_name_for_task};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::cli::{ProviderRegistry, RegistryError};
use crate::multiplexer::Multiplexer;
use crate::status::{patterns, SessionActivity, StatusDetector};
use crate::storage::{
    SessionRecord, Storage, StorageError, WorkerConfig, WorkerStatus,
};
use crate::worktree;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone)]
pub struct SpawnWorkerOptions {
    pub agent_type: String,
    pub model: Option<String>,
    pub use_worktree: bool,
    pub base_branch: Option<String>,
    /// Explicit branch name; derived from the task when absent.
    pub branch: Option<String>,
    /// Explicit display name; derived from the task when absent.
    pub name: Option<String>,
    /// Workers run unattended, so auto-approve defaults on.
    pub auto_approve: bool,
    /// Pre-assigned dev-server port, substituted into setup scripts.
    pub port: Option<u16>,
}

impl Default for SpawnWorkerOptions {
    fn default() -> Self {
        Self {
            agent_type: "claude".to_string(),
            model: None,
            use_worktree: false,
            base_branch: None,
            branch: None,
            name: None,
            auto_approve: true,
            port: None,
        }
    }
}

/// Worker status as reported upward: persisted lifecycle overlaid with the
/// live observation. `Dead` is live-only; it is never written back.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLiveStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Dead,
}

/// Reporting projection over a worker's stored row and its live state.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub record: SessionRecord,
    pub live_activity: SessionActivity,
    pub status: WorkerLiveStatus,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WorkersSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
}

/// Spawns and supervises worker sessions on behalf of a conductor session.
pub struct WorkerOrchestrator {
    storage: Arc<Storage>,
    registry: ProviderRegistry,
    mux: Arc<dyn Multiplexer>,
    detector: Arc<StatusDetector>,
    config: WorkerConfig,
}

impl WorkerOrchestrator {
    pub fn new(
        storage: Arc<Storage>,
        registry: ProviderRegistry,
        mux: Arc<dyn Multiplexer>,
        detector: Arc<StatusDetector>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            mux,
            detector,
            config,
        }
    }

    /// Spawn an isolated worker for a sub-task and inject the task text once
    /// the agent looks ready.
    ///
    /// Worktree or setup failures degrade to running the worker in the
    /// original directory; only storage and unknown-provider failures are
    /// hard errors. Returns the up-to-date session record.
    pub async fn spawn_worker(
        &self,
        conductor_id: &str,
        task: &str,
        working_dir: &Path,
        options: SpawnWorkerOptions,
    ) -> Result<SessionRecord, OrchestratorError> {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let branch = options
            .branch
            .clone()
            .unwrap_or_else(|| naming::branch_name_for_task(task, epoch));
        let display_name = options
            .name
            .clone()
            .unwrap_or_else(|| naming::session_name_for_task(task));

        let mut worktree_path: Option<PathBuf> = None;
        if options.use_worktree {
            match worktree::create_worktree(working_dir, &branch) {
                Ok(path) => {
                    let outcome = worktree::setup_worker_env(
                        working_dir,
                        &path,
                        options.port,
                        &self.config.setup_scripts,
                    )
                    .await;
                    if outcome.success {
                        worktree_path = Some(path);
                    } else {
                        tracing::warn!(
                            "Worktree setup failed for {}; falling back to {}",
                            branch,
                            working_dir.display()
                        );
                        worktree::delete_worktree(&path, Some(working_dir));
                    }
                }
                Err(e) => {
                    tracing::warn!("Worktree creation failed ({}); running worker unisolated", e);
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        let mut record = SessionRecord::new(
            &id,
            &display_name,
            &working_dir.to_string_lossy(),
            &options.agent_type,
        );
        record.model = options.model.clone();
        record.auto_approve = options.auto_approve;
        record.conductor_session_id = Some(conductor_id.to_string());
        record.worker_task = Some(task.to_string());
        record.worker_status = Some(WorkerStatus::Pending);
        record.dev_server_port = options.port;
        if let Some(ref path) = worktree_path {
            record.worktree_path = Some(path.to_string_lossy().to_string());
            record.worktree_branch = Some(branch.clone());
            record.base_branch = options.base_branch.clone();
        }

        let mux_name = self.registry.session_name(&options.agent_type, &id)?;
        let built = self.registry.build_interactive_command(
            &options.agent_type,
            record.model.as_deref(),
            record.auto_approve,
        )?;
        self.storage.create_session(&record)?;

        let run_dir = worktree_path.as_deref().unwrap_or(working_dir);
        if let Err(e) = self.mux.create_session(&mux_name, run_dir, &built.to_shell()) {
            tracing::error!("Failed to create multiplexer session {}: {}", mux_name, e);
            return Ok(self.storage.update_session(&id, |s| {
                s.worker_status = Some(WorkerStatus::Failed);
            })?);
        }

        let (ready, trust) = self
            .registry
            .get(&options.agent_type)
            .map(|p| (p.ready_patterns.clone(), p.trust_patterns.clone()))
            .unwrap_or_default();
        self.wait_for_ready(&mux_name, &ready, &trust).await;

        let sent = self.inject(&mux_name, task);
        let status = if sent {
            WorkerStatus::Running
        } else {
            WorkerStatus::Failed
        };
        Ok(self
            .storage
            .update_session(&id, |s| s.worker_status = Some(status))?)
    }

    /// Bounded readiness poll: confirm trust banners as they appear, stop
    /// early on the agent's ready footer, and proceed anyway at the ceiling.
    pub(crate) async fn wait_for_ready(&self, name: &str, ready: &[String], trust: &[String]) {
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let attempts =
            (self.config.ready_timeout_ms / self.config.poll_interval_ms.max(1)).max(1);

        for _ in 0..attempts {
            match self.mux.capture_pane(name, 10) {
                Ok(pane) => {
                    if patterns::matches_any(&pane, trust, 10) {
                        tracing::info!("Confirming trust prompt in {}", name);
                        let _ = self.mux.send_key(name, "Enter");
                    } else if patterns::matches_any(&pane, ready, 3) {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!("Readiness capture failed for {}: {}", name, e);
                }
            }
            tokio::time::sleep(interval).await;
        }

        tracing::warn!(
            "Worker session {} never confirmed readiness; sending task anyway",
            name
        );
    }

    fn inject(&self, name: &str, text: &str) -> bool {
        let clean = text.trim_end_matches(['\r', '\n']);
        if let Err(e) = self.mux.send_text(name, clean) {
            tracing::warn!("Failed to send text to {}: {}", name, e);
            return false;
        }
        if let Err(e) = self.mux.send_key(name, "Enter") {
            tracing::warn!("Failed to send Enter to {}: {}", name, e);
            return false;
        }
        true
    }

    /// Persisted worker rows for a conductor with their live status overlay.
    /// Terminal persisted states win; pending/running are refreshed from the
    /// live reality, including silent death.
    pub fn get_workers(&self, conductor_id: &str) -> Result<Vec<WorkerInfo>, OrchestratorError> {
        let workers: Vec<SessionRecord> = self
            .storage
            .list_sessions()?
            .into_iter()
            .filter(|s| s.conductor_session_id.as_deref() == Some(conductor_id))
            .collect();

        let names: Vec<String> = workers
            .iter()
            .filter_map(|w| self.registry.session_name(&w.agent_type, &w.id).ok())
            .collect();
        let statuses = self.detector.get_all_statuses(&names);

        Ok(workers
            .into_iter()
            .map(|record| {
                let live = self
                    .registry
                    .session_name(&record.agent_type, &record.id)
                    .ok()
                    .and_then(|name| statuses.get(&name).copied())
                    .unwrap_or(SessionActivity::Dead);
                WorkerInfo {
                    status: effective_status(record.worker_status, live),
                    live_activity: live,
                    record,
                }
            })
            .collect())
    }

    /// Capture a worker's pane scrollback; an unreachable session yields
    /// empty output, not an error.
    pub fn get_worker_output(
        &self,
        worker_id: &str,
        lines: u32,
    ) -> Result<String, OrchestratorError> {
        let record = self.storage.get_session(worker_id)?;
        let name = self.registry.session_name(&record.agent_type, &record.id)?;
        Ok(self.mux.capture_pane(&name, lines).unwrap_or_default())
    }

    /// Inject literal input plus Enter. Returns whether the send reached a
    /// live session.
    pub fn send_to_worker(&self, worker_id: &str, text: &str) -> Result<bool, OrchestratorError> {
        let record = self.storage.get_session(worker_id)?;
        let name = self.registry.session_name(&record.agent_type, &record.id)?;
        Ok(self.inject(&name, text))
    }

    pub fn complete_worker(&self, worker_id: &str) -> Result<SessionRecord, OrchestratorError> {
        Ok(self.storage.update_session(worker_id, |s| {
            s.worker_status = Some(WorkerStatus::Completed);
        })?)
    }

    pub fn fail_worker(&self, worker_id: &str) -> Result<SessionRecord, OrchestratorError> {
        Ok(self.storage.update_session(worker_id, |s| {
            s.worker_status = Some(WorkerStatus::Failed);
        })?)
    }

    /// Best-effort teardown: kill the multiplexer session (already gone is
    /// success), optionally delete the worktree, and always leave the worker
    /// in a terminal failed state.
    pub fn kill_worker(
        &self,
        worker_id: &str,
        cleanup_worktree: bool,
    ) -> Result<SessionRecord, OrchestratorError> {
        let record = self.storage.get_session(worker_id)?;

        if let Ok(name) = self.registry.session_name(&record.agent_type, &record.id) {
            if let Err(e) = self.mux.kill_session(&name) {
                tracing::debug!("Kill of {} reported {}; treating as already gone", name, e);
            }
        }

        if cleanup_worktree {
            if let Some(ref path) = record.worktree_path {
                let project = PathBuf::from(&record.working_dir);
                if !worktree::delete_worktree(Path::new(path), Some(&project)) {
                    tracing::warn!("Could not confirm worktree removal for {}", path);
                }
            }
        }

        Ok(self.storage.update_session(worker_id, |s| {
            s.worker_status = Some(WorkerStatus::Failed);
        })?)
    }

    /// Pure aggregation over `get_workers`; no additional I/O.
    pub fn get_workers_summary(
        &self,
        conductor_id: &str,
    ) -> Result<WorkersSummary, OrchestratorError> {
        let mut summary = WorkersSummary::default();
        for worker in self.get_workers(conductor_id)? {
            summary.total += 1;
            match worker.status {
                WorkerLiveStatus::Pending => summary.pending += 1,
                WorkerLiveStatus::Running => summary.running += 1,
                WorkerLiveStatus::Completed => summary.completed += 1,
                WorkerLiveStatus::Failed => summary.failed += 1,
                WorkerLiveStatus::Dead => summary.dead += 1,
            }
        }
        Ok(summary)
    }
}

fn effective_status(persisted: Option<WorkerStatus>, live: SessionActivity) -> WorkerLiveStatus {
    match persisted {
        Some(WorkerStatus::Completed) => WorkerLiveStatus::Completed,
        Some(WorkerStatus::Failed) => WorkerLiveStatus::Failed,
        other => match live {
            SessionActivity::Dead => WorkerLiveStatus::Dead,
            SessionActivity::Running => WorkerLiveStatus::Running,
            _ => match other {
                Some(WorkerStatus::Running) => WorkerLiveStatus::Running,
                _ => WorkerLiveStatus::Pending,
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplexer::testing::FakeMultiplexer;
    use crate::storage::ProviderConfig;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn test_provider() -> ProviderConfig {
        ProviderConfig {
            command: "claude".to_string(),
            auto_approve_flag: Some("--dangerously-skip-permissions".to_string()),
            model_flag: Some("--model".to_string()),
            default_model: "opus".to_string(),
            resume_flag: Some("--resume".to_string()),
            print_args: vec![],
            env: None,
            session_prefix: "claude".to_string(),
            ready_patterns: vec!["? for shortcuts".to_string()],
            trust_patterns: vec!["Do you trust the files in this folder?".to_string()],
        }
    }

    fn orchestrator() -> (TempDir, Arc<Storage>, Arc<FakeMultiplexer>, WorkerOrchestrator) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new_with_base(dir.path().to_path_buf()).unwrap());
        let mux = Arc::new(FakeMultiplexer::new());
        let detector = Arc::new(StatusDetector::new(
            Arc::clone(&mux) as Arc<dyn Multiplexer>
        ));

        let mut providers = HashMap::new();
        providers.insert("claude".to_string(), test_provider());

        let config = WorkerConfig {
            poll_interval_ms: 1,
            ready_timeout_ms: 10,
            setup_scripts: vec![],
        };
        let orchestrator = WorkerOrchestrator::new(
            Arc::clone(&storage),
            ProviderRegistry::new(providers),
            Arc::clone(&mux) as Arc<dyn Multiplexer>,
            detector,
            config,
        );
        (dir, storage, mux, orchestrator)
    }

    #[tokio::test]
    async fn test_spawn_worker_falls_back_when_directory_is_not_a_repo() {
        let (dir, _storage, mux, orchestrator) = orchestrator();

        let record = orchestrator
            .spawn_worker(
                "conductor-1",
                "add dark mode toggle",
                dir.path(),
                SpawnWorkerOptions {
                    use_worktree: true,
                    ..SpawnWorkerOptions::default()
                },
            )
            .await
            .unwrap();

        // No isolation, but the spawn went through
        assert!(record.worktree_path.is_none());
        assert_eq!(record.name, "add dark mode toggle");
        assert_eq!(record.worker_status, Some(WorkerStatus::Running));
        assert_eq!(record.conductor_session_id.as_deref(), Some("conductor-1"));

        let mux_name = format!("claude-{}", record.id);
        assert!(mux.has_session(&mux_name));
        assert_eq!(mux.sent_text(&mux_name), vec!["add dark mode toggle"]);
        assert_eq!(mux.sent_keys(&mux_name).last().map(String::as_str), Some("Enter"));

        // The interactive command carries the auto-approve flag
        let command = mux.sessions.lock()[&mux_name].command.clone();
        assert!(command.contains("--dangerously-skip-permissions"));
    }

    #[tokio::test]
    async fn test_spawn_worker_marks_failed_when_session_creation_fails() {
        let (dir, _storage, mux, orchestrator) = orchestrator();
        *mux.fail_creates.lock() = true;

        let record = orchestrator
            .spawn_worker("c1", "some task", dir.path(), SpawnWorkerOptions::default())
            .await
            .unwrap();
        assert_eq!(record.worker_status, Some(WorkerStatus::Failed));
    }

    #[tokio::test]
    async fn test_wait_for_ready_stops_early_on_ready_footer() {
        let (_dir, _storage, mux, orchestrator) = orchestrator();
        mux.add_session("claude-w");
        mux.set_pane("claude-w", "Welcome!\n? for shortcuts\n");

        // A generous ceiling that the early stop never reaches
        let slow = WorkerOrchestrator {
            config: WorkerConfig {
                poll_interval_ms: 50,
                ready_timeout_ms: 60_000,
                setup_scripts: vec![],
            },
            ..orchestrator
        };
        tokio::time::timeout(
            Duration::from_secs(2),
            slow.wait_for_ready(
                "claude-w",
                &["? for shortcuts".to_string()],
                &[],
            ),
        )
        .await
        .expect("ready footer should stop the poll early");
    }

    #[tokio::test]
    async fn test_wait_for_ready_confirms_trust_banner() {
        let (_dir, _storage, mux, orchestrator) = orchestrator();
        mux.add_session("claude-w");
        mux.set_pane("claude-w", "Do you trust the files in this folder?\n");

        orchestrator
            .wait_for_ready(
                "claude-w",
                &[],
                &["Do you trust the files in this folder?".to_string()],
            )
            .await;
        assert!(mux.sent_keys("claude-w").contains(&"Enter".to_string()));
    }

    #[tokio::test]
    async fn test_get_workers_detects_silent_death() {
        let (dir, _storage, mux, orchestrator) = orchestrator();
        let record = orchestrator
            .spawn_worker("c1", "task one", dir.path(), SpawnWorkerOptions::default())
            .await
            .unwrap();
        assert_eq!(record.worker_status, Some(WorkerStatus::Running));

        mux.remove_session(&format!("claude-{}", record.id));

        let workers = orchestrator.get_workers("c1").unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].status, WorkerLiveStatus::Dead);
        // The observation is live-only; storage still says running
        assert_eq!(workers[0].record.worker_status, Some(WorkerStatus::Running));
    }

    #[tokio::test]
    async fn test_terminal_status_wins_over_live_observation() {
        let (dir, _storage, _mux, orchestrator) = orchestrator();
        let record = orchestrator
            .spawn_worker("c1", "task one", dir.path(), SpawnWorkerOptions::default())
            .await
            .unwrap();

        orchestrator.complete_worker(&record.id).unwrap();
        let workers = orchestrator.get_workers("c1").unwrap();
        assert_eq!(workers[0].status, WorkerLiveStatus::Completed);
    }

    #[tokio::test]
    async fn test_kill_worker_always_ends_failed() {
        let (dir, _storage, mux, orchestrator) = orchestrator();
        let record = orchestrator
            .spawn_worker("c1", "doomed task", dir.path(), SpawnWorkerOptions::default())
            .await
            .unwrap();

        // The multiplexer session is already gone; kill still succeeds
        mux.remove_session(&format!("claude-{}", record.id));
        let killed = orchestrator.kill_worker(&record.id, false).unwrap();
        assert_eq!(killed.worker_status, Some(WorkerStatus::Failed));
    }

    #[tokio::test]
    async fn test_kill_worker_cleans_up_worktree_directory() {
        let (dir, storage, _mux, orchestrator) = orchestrator();
        let worktree_dir = dir.path().join("wt");
        std::fs::create_dir(&worktree_dir).unwrap();
        std::fs::write(worktree_dir.join("scratch.rs"), "// wip").unwrap();

        let mut record = SessionRecord::new("w1", "n", &dir.path().to_string_lossy(), "claude");
        record.conductor_session_id = Some("c1".to_string());
        record.worker_status = Some(WorkerStatus::Running);
        record.worktree_path = Some(worktree_dir.to_string_lossy().to_string());
        storage.create_session(&record).unwrap();

        let killed = orchestrator.kill_worker("w1", true).unwrap();
        assert_eq!(killed.worker_status, Some(WorkerStatus::Failed));
        assert!(!worktree_dir.exists());
    }

    #[tokio::test]
    async fn test_workers_summary_counts_by_status() {
        let (dir, _storage, mux, orchestrator) = orchestrator();
        let a = orchestrator
            .spawn_worker("c1", "task a", dir.path(), SpawnWorkerOptions::default())
            .await
            .unwrap();
        let b = orchestrator
            .spawn_worker("c1", "task b", dir.path(), SpawnWorkerOptions::default())
            .await
            .unwrap();
        let c = orchestrator
            .spawn_worker("c1", "task c", dir.path(), SpawnWorkerOptions::default())
            .await
            .unwrap();

        orchestrator.complete_worker(&a.id).unwrap();
        orchestrator.fail_worker(&b.id).unwrap();
        mux.remove_session(&format!("claude-{}", c.id));

        let summary = orchestrator.get_workers_summary("c1").unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.dead, 1);
    }

    #[tokio::test]
    async fn test_send_to_worker_and_output_capture() {
        let (dir, _storage, mux, orchestrator) = orchestrator();
        let record = orchestrator
            .spawn_worker("c1", "task", dir.path(), SpawnWorkerOptions::default())
            .await
            .unwrap();
        let mux_name = format!("claude-{}", record.id);

        assert!(orchestrator.send_to_worker(&record.id, "status update?\n").unwrap());
        // Trailing newlines are stripped before injection
        assert_eq!(
            mux.sent_text(&mux_name).last().map(String::as_str),
            Some("status update?")
        );

        mux.set_pane(&mux_name, "worker output here\n");
        assert_eq!(
            orchestrator.get_worker_output(&record.id, 100).unwrap(),
            "worker output here\n"
        );

        // A vanished session degrades to empty output
        mux.remove_session(&mux_name);
        assert_eq!(orchestrator.get_worker_output(&record.id, 100).unwrap(), "");
        assert!(!orchestrator.send_to_worker(&record.id, "hello").unwrap());
    }
}
