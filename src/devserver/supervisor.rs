use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;
use uuid::Uuid;

use crate::storage::{DevServerRecord, ServerStatus, ServerType, Storage, StorageError};

/// How long a SIGTERM'd node server gets before escalation to SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DevServerError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to spawn dev server: {0}")]
    Spawn(String),
    #[error("Docker command failed: {0}")]
    Docker(String),
}

#[derive(Debug, Clone)]
pub struct StartServerOptions {
    pub project_id: String,
    pub server_type: ServerType,
    pub name: String,
    pub command: String,
    pub working_dir: String,
    pub ports: Vec<u16>,
}

/// Starts, stops and tracks auxiliary long-running processes (node) or
/// containers (docker) per project.
///
/// Holds no in-memory copy of any record; every operation re-reads storage
/// so state survives restarts of the orchestrating process itself.
pub struct DevServerSupervisor {
    storage: Arc<Storage>,
}

impl DevServerSupervisor {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Start a server. The `starting` record is written before any spawn so
    /// a crash mid-start stays observable. Spawn failures move the record to
    /// `failed` and propagate.
    pub async fn start_server(
        &self,
        options: StartServerOptions,
    ) -> Result<DevServerRecord, DevServerError> {
        let now = Utc::now();
        let record = DevServerRecord {
            id: Uuid::new_v4().to_string(),
            project_id: options.project_id,
            server_type: options.server_type,
            name: options.name,
            command: options.command,
            status: ServerStatus::Starting,
            pid: None,
            container_id: None,
            ports: options.ports,
            working_dir: options.working_dir,
            created_at: now,
            updated_at: now,
        };
        self.storage.create_server(&record)?;

        self.launch(&record).await
    }

    async fn launch(&self, record: &DevServerRecord) -> Result<DevServerRecord, DevServerError> {
        match record.server_type {
            ServerType::Node => self.launch_node(record).await,
            ServerType::Docker => self.launch_docker(record).await,
        }
    }

    async fn launch_node(
        &self,
        record: &DevServerRecord,
    ) -> Result<DevServerRecord, DevServerError> {
        let log_path = self.storage.server_log_path(&record.id)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let err_log = log.try_clone()?;

        // Through a shell so nvm/volta-shimmed binaries resolve; its own
        // process group so it outlives us and stop can sweep the group
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&record.command)
            .current_dir(&record.working_dir)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(err_log)
            .process_group(0);
        if let Some(port) = record.ports.first() {
            cmd.env("PORT", port.to_string());
        }

        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id();
                tracing::info!("Started dev server {} (pid {:?})", record.name, pid);
                Ok(self.storage.update_server(&record.id, |s| {
                    s.status = ServerStatus::Running;
                    s.pid = pid;
                })?)
            }
            Err(e) => {
                tracing::error!("Failed to spawn dev server {}: {}", record.name, e);
                let _ = self
                    .storage
                    .update_server(&record.id, |s| s.status = ServerStatus::Failed);
                Err(DevServerError::Spawn(e.to_string()))
            }
        }
    }

    async fn launch_docker(
        &self,
        record: &DevServerRecord,
    ) -> Result<DevServerRecord, DevServerError> {
        if let Err(e) = run_command(
            "docker",
            &["compose", "up", "-d", &record.name],
            &record.working_dir,
        )
        .await
        {
            let _ = self
                .storage
                .update_server(&record.id, |s| s.status = ServerStatus::Failed);
            return Err(DevServerError::Docker(e));
        }

        let container_id = run_command(
            "docker",
            &["compose", "ps", "-q", &record.name],
            &record.working_dir,
        )
        .await
        .map(|out| out.trim().to_string())
        .unwrap_or_default();

        Ok(self.storage.update_server(&record.id, |s| {
            s.status = ServerStatus::Running;
            s.container_id = if container_id.is_empty() {
                None
            } else {
                Some(container_id.clone())
            };
        })?)
    }

    /// Stop a server. Node servers get SIGTERM, a grace wait, then SIGKILL,
    /// plus a sweep of anything still listening on the recorded ports (the
    /// tracked PID may be a wrapper shell whose child outlived it).
    pub async fn stop_server(&self, id: &str) -> Result<DevServerRecord, DevServerError> {
        let record = self.storage.get_server(id)?;

        match record.server_type {
            ServerType::Docker => {
                if let Some(ref container_id) = record.container_id {
                    if let Err(e) =
                        run_command("docker", &["stop", container_id], &record.working_dir).await
                    {
                        tracing::warn!("docker stop {} reported: {}", container_id, e);
                    }
                }
            }
            ServerType::Node => {
                if let Some(pid) = record.pid {
                    terminate_pid(pid).await;
                }
                for port in &record.ports {
                    for pid in pids_listening_on(*port).await {
                        tracing::info!("Sweeping pid {} still listening on port {}", pid, port);
                        signal(pid, libc::SIGTERM);
                    }
                }
            }
        }

        Ok(self.storage.update_server(id, |s| {
            s.status = ServerStatus::Stopped;
            s.pid = None;
        })?)
    }

    /// Stop, then respawn with the same stored command and ports.
    pub async fn restart_server(&self, id: &str) -> Result<DevServerRecord, DevServerError> {
        self.stop_server(id).await?;
        let record = self
            .storage
            .update_server(id, |s| s.status = ServerStatus::Starting)?;
        self.launch(&record).await
    }

    /// Stop the server, then delete its record and log file.
    pub async fn remove_server(&self, id: &str) -> Result<(), DevServerError> {
        if let Err(e) = self.stop_server(id).await {
            tracing::warn!("Stop during removal of {} reported: {}", id, e);
        }
        if let Ok(log_path) = self.storage.server_log_path(id) {
            if log_path.exists() {
                let _ = std::fs::remove_file(log_path);
            }
        }
        self.storage.delete_server(id)?;
        Ok(())
    }

    /// Derive the real status from the OS and correct storage to match.
    /// The stored status is never trusted.
    pub async fn get_server_status(&self, id: &str) -> Result<ServerStatus, DevServerError> {
        let record = self.storage.get_server(id)?;

        let actual = match record.server_type {
            ServerType::Node => self.derive_node_status(&record).await,
            ServerType::Docker => derive_docker_status(&record).await,
        };

        if actual != record.status {
            let _ = self.storage.update_server(id, |s| s.status = actual);
        }
        Ok(actual)
    }

    async fn derive_node_status(&self, record: &DevServerRecord) -> ServerStatus {
        if let Some(pid) = record.pid {
            if pid_alive(pid) {
                return ServerStatus::Running;
            }
        }

        // The tracked PID is gone; a listener on the recorded port means the
        // real server is still up, so re-resolve and persist its PID
        for port in &record.ports {
            if let Some(&pid) = pids_listening_on(*port).await.first() {
                let _ = self.storage.update_server(&record.id, |s| s.pid = Some(pid));
                return ServerStatus::Running;
            }
        }

        match record.status {
            // It was supposed to be up; it died without a stop
            ServerStatus::Running | ServerStatus::Starting => ServerStatus::Failed,
            other => other,
        }
    }

    pub fn get_server_logs(&self, id: &str, tail: usize) -> Result<String, DevServerError> {
        self.storage.get_server(id)?;
        let log_path = self.storage.server_log_path(id)?;
        if !log_path.exists() {
            return Ok(String::new());
        }
        let content = std::fs::read_to_string(log_path)?;
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(tail);
        Ok(lines[start..].join("\n"))
    }

    pub fn get_all_servers(&self) -> Result<Vec<DevServerRecord>, DevServerError> {
        Ok(self.storage.list_servers()?)
    }

    pub fn get_servers_by_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<DevServerRecord>, DevServerError> {
        Ok(self
            .storage
            .list_servers()?
            .into_iter()
            .filter(|s| s.project_id == project_id)
            .collect())
    }

    /// Startup sweep: no child process survives a crash of this host
    /// process, so any persisted `running` record whose process is gone gets
    /// corrected. Returns how many records changed.
    pub async fn cleanup_orphaned_servers(&self) -> Result<usize, DevServerError> {
        let candidates: Vec<DevServerRecord> = self
            .storage
            .list_servers()?
            .into_iter()
            .filter(|r| matches!(r.status, ServerStatus::Running | ServerStatus::Starting))
            .collect();

        let checks = candidates.iter().map(|record| self.get_server_status(&record.id));
        let results = futures::future::join_all(checks).await;

        let mut corrected = 0;
        for (record, result) in candidates.iter().zip(results) {
            match result {
                Ok(ServerStatus::Running) => {}
                Ok(_) => {
                    tracing::info!("Corrected orphaned dev server record {}", record.id);
                    corrected += 1;
                }
                Err(e) => tracing::warn!("Orphan check failed for {}: {}", record.id, e),
            }
        }
        Ok(corrected)
    }
}

fn signal(pid: u32, sig: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

async fn terminate_pid(pid: u32) {
    signal(pid, libc::SIGTERM);
    tokio::time::sleep(STOP_GRACE).await;
    if pid_alive(pid) {
        tracing::warn!("Pid {} survived SIGTERM; escalating to SIGKILL", pid);
        signal(pid, libc::SIGKILL);
    }
}

/// PIDs with a listener on the given port, via `lsof`. Failures (including
/// a missing lsof) degrade to an empty list.
async fn pids_listening_on(port: u16) -> Vec<u32> {
    let output = Command::new("lsof")
        .args(["-ti", &format!(":{}", port)])
        .stdin(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect(),
        Err(_) => Vec::new(),
    }
}

async fn run_command(program: &str, args: &[&str], cwd: &str) -> Result<String, String> {
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| e.to_string())?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(if stderr.is_empty() {
            format!("{} exited with {:?}", program, output.status.code())
        } else {
            stderr
        })
    }
}

async fn derive_docker_status(record: &DevServerRecord) -> ServerStatus {
    let Some(ref container_id) = record.container_id else {
        return ServerStatus::Stopped;
    };

    match run_command(
        "docker",
        &["inspect", "-f", "{{.State.Status}}", container_id],
        &record.working_dir,
    )
    .await
    {
        Ok(output) => match output.trim() {
            "running" => ServerStatus::Running,
            "created" | "restarting" | "paused" => ServerStatus::Starting,
            _ => ServerStatus::Stopped,
        },
        // Container gone (or docker unavailable): not running
        Err(_) => ServerStatus::Stopped,
    }
}
