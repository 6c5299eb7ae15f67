use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Regex for validating record IDs - only alphanumeric, dash, and underscore allowed
static RECORD_ID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_-]+$").expect("Invalid record ID validation regex")
});

/// Validate a record ID to prevent path traversal attacks.
/// Record IDs must contain only alphanumeric characters, dashes, and underscores.
pub fn validate_record_id(id: &str) -> Result<(), StorageError> {
    if id.is_empty() {
        return Err(StorageError::InvalidPath("Record ID cannot be empty".to_string()));
    }

    if id.contains('\0') {
        return Err(StorageError::InvalidPath("Record ID cannot contain null bytes".to_string()));
    }

    if id.contains("..") {
        return Err(StorageError::InvalidPath("Record ID cannot contain '..'".to_string()));
    }

    if !RECORD_ID_REGEX.is_match(id) {
        return Err(StorageError::InvalidPath(
            "Record ID must contain only alphanumeric characters, dashes, and underscores".to_string()
        ));
    }

    // UUID is 36 chars, allow some buffer
    if id.len() > 128 {
        return Err(StorageError::InvalidPath("Record ID is too long".to_string()));
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Dev server not found: {0}")]
    ServerNotFound(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Status of an agent session's current turn, as tracked by the process manager.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Waiting,
    Error,
}

/// Persisted lifecycle of a worker session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A persisted unit of agent work bound to a working directory.
///
/// Storage is authoritative for every field here; orchestration components
/// read and write individual fields through `update_session` but never own
/// the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub working_dir: String,
    pub agent_type: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub auto_approve: bool,
    pub status: SessionStatus,
    /// Agent-internal session id reported on init, used for turn resumption.
    #[serde(default)]
    pub resume_id: Option<String>,
    /// Fork lineage.
    #[serde(default)]
    pub parent_session_id: Option<String>,
    /// Worker lineage: the session that spawned this one.
    #[serde(default)]
    pub conductor_session_id: Option<String>,
    #[serde(default)]
    pub worker_task: Option<String>,
    #[serde(default)]
    pub worker_status: Option<WorkerStatus>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub worktree_branch: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub dev_server_port: Option<u16>,
    #[serde(default)]
    pub pr_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Create a fresh record with the bookkeeping fields defaulted.
    pub fn new(id: &str, name: &str, working_dir: &str, agent_type: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            working_dir: working_dir.to_string(),
            agent_type: agent_type.to_string(),
            model: None,
            auto_approve: false,
            status: SessionStatus::Idle,
            resume_id: None,
            parent_session_id: None,
            conductor_session_id: None,
            worker_task: None,
            worker_status: None,
            worktree_path: None,
            worktree_branch: None,
            base_branch: None,
            dev_server_port: None,
            pr_url: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerType {
    Node,
    Docker,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Failed,
}

/// A managed auxiliary process or container attached to a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevServerRecord {
    pub id: String,
    pub project_id: String,
    pub server_type: ServerType,
    pub name: String,
    pub command: String,
    pub status: ServerStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    pub working_dir: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row in a session's message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(id: &str, role: &str, content: &str) -> Self {
        Self {
            id: id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Per-provider CLI definition: command, flag templates, and the pane
/// patterns the worker readiness poll scans for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub command: String,
    #[serde(default)]
    pub auto_approve_flag: Option<String>,
    #[serde(default)]
    pub model_flag: Option<String>,
    pub default_model: String,
    #[serde(default)]
    pub resume_flag: Option<String>,
    /// Extra args for a non-interactive stream-JSON turn.
    #[serde(default)]
    pub print_args: Vec<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    /// Prefix for multiplexer session names owned by this provider.
    pub session_prefix: String,
    /// Pane substrings that mean the agent is ready for input.
    #[serde(default)]
    pub ready_patterns: Vec<String>,
    /// Pane substrings that mean a trust/permission banner needs a confirm key.
    #[serde(default)]
    pub trust_patterns: Vec<String>,
}

/// Port allocation range: base, base+increment, ... up to max_ports candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub base_port: u16,
    pub increment: u16,
    pub max_ports: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            base_port: 4100,
            increment: 1,
            max_ports: 400,
        }
    }
}

/// Worker spawn tunables. Tests shrink the intervals to near-zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub ready_timeout_ms: u64,
    /// Optional setup script list run in a fresh worktree; each entry may use
    /// $ROOT_WORKTREE_PATH, $WORKTREE_PATH and $PORT placeholders.
    #[serde(default)]
    pub setup_scripts: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            ready_timeout_ms: 30_000,
            setup_scripts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub ports: PortConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// JSON-file persistence rooted at a base directory.
///
/// Layout: `sessions/<id>.json`, `sessions/<id>.messages.log` (NDJSON),
/// `servers/<id>.json`, `logs/devserver-<id>.log`, `config.json`.
pub struct Storage {
    base_dir: PathBuf,
}

impl Storage {
    /// Create a new Storage, initializing the base directory if needed
    pub fn new() -> Result<Self, StorageError> {
        let base_dir = Self::default_base_dir()?;
        Self::new_with_base(base_dir)
    }

    /// Create a Storage with a custom base directory (for testing)
    pub fn new_with_base(base_dir: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&base_dir)?;
        fs::create_dir_all(base_dir.join("sessions"))?;
        fs::create_dir_all(base_dir.join("servers"))?;
        fs::create_dir_all(base_dir.join("logs"))?;

        // Create default config if it doesn't exist
        let config_path = base_dir.join("config.json");
        if !config_path.exists() {
            let default_config = Self::default_config();
            fs::write(&config_path, serde_json::to_string_pretty(&default_config)?)?;
        }

        Ok(Self { base_dir })
    }

    fn default_base_dir() -> Result<PathBuf, StorageError> {
        crate::paths::home_dir()
            .map(|home| home.join(".config").join("conductor"))
            .ok_or_else(|| StorageError::InvalidPath("HOME not set".to_string()))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn sessions_dir(&self) -> PathBuf {
        self.base_dir.join("sessions")
    }

    fn servers_dir(&self) -> PathBuf {
        self.base_dir.join("servers")
    }

    fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    fn session_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        validate_record_id(id)?;
        Ok(self.sessions_dir().join(format!("{}.json", id)))
    }

    fn messages_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        validate_record_id(id)?;
        Ok(self.sessions_dir().join(format!("{}.messages.log", id)))
    }

    fn server_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        validate_record_id(id)?;
        Ok(self.servers_dir().join(format!("{}.json", id)))
    }

    /// Path of a dev server's stdout/stderr log file.
    pub fn server_log_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        validate_record_id(id)?;
        Ok(self.logs_dir().join(format!("devserver-{}.log", id)))
    }

    // ---- sessions ----

    pub fn create_session(&self, record: &SessionRecord) -> Result<(), StorageError> {
        let path = self.session_path(&record.id)?;
        fs::write(path, serde_json::to_string_pretty(record)?)?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<SessionRecord, StorageError> {
        let path = self.session_path(id)?;
        if !path.exists() {
            return Err(StorageError::SessionNotFound(id.to_string()));
        }
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Load, mutate, and rewrite a session record. Bumps `updated_at`.
    pub fn update_session<F>(&self, id: &str, mutate: F) -> Result<SessionRecord, StorageError>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let mut record = self.get_session(id)?;
        mutate(&mut record);
        record.updated_at = Utc::now();
        fs::write(self.session_path(id)?, serde_json::to_string_pretty(&record)?)?;
        Ok(record)
    }

    pub fn delete_session(&self, id: &str) -> Result<(), StorageError> {
        let path = self.session_path(id)?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        let messages = self.messages_path(id)?;
        if messages.exists() {
            fs::remove_file(messages)?;
        }
        Ok(())
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>, StorageError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(self.sessions_dir())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Skip records that fail to parse rather than failing the listing
            match fs::read_to_string(&path).map_err(StorageError::from).and_then(|json| {
                serde_json::from_str::<SessionRecord>(&json).map_err(StorageError::from)
            }) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping unreadable session record {:?}: {}", path, e),
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    // ---- messages ----

    /// Append a message row; returns false if a row with the same id was
    /// already written (idempotent replay).
    pub fn append_message(
        &self,
        session_id: &str,
        message: &MessageRecord,
    ) -> Result<bool, StorageError> {
        let path = self.messages_path(session_id)?;

        use std::fs::OpenOptions;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        // Exclusive lock covers the duplicate check plus the append
        file.lock_exclusive().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Failed to acquire file lock: {}", e),
            ))
        })?;

        let existing = fs::read_to_string(&path)?;
        let duplicate = existing.lines().any(|line| {
            serde_json::from_str::<MessageRecord>(line)
                .map(|m| m.id == message.id)
                .unwrap_or(false)
        });

        let result = if duplicate {
            Ok(false)
        } else {
            let line = format!("{}\n", serde_json::to_string(message)?);
            file.write_all(line.as_bytes()).map(|_| true).map_err(StorageError::from)
        };

        let _ = fs2::FileExt::unlock(&file);
        result
    }

    pub fn read_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let path = self.messages_path(session_id)?;
        if !path.exists() {
            return Ok(vec![]);
        }
        let content = fs::read_to_string(path)?;
        let mut messages: Vec<MessageRecord> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        if let Some(limit) = limit {
            if messages.len() > limit {
                messages = messages.split_off(messages.len() - limit);
            }
        }
        Ok(messages)
    }

    // ---- dev servers ----

    pub fn create_server(&self, record: &DevServerRecord) -> Result<(), StorageError> {
        let path = self.server_path(&record.id)?;
        fs::write(path, serde_json::to_string_pretty(record)?)?;
        Ok(())
    }

    pub fn get_server(&self, id: &str) -> Result<DevServerRecord, StorageError> {
        let path = self.server_path(id)?;
        if !path.exists() {
            return Err(StorageError::ServerNotFound(id.to_string()));
        }
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn update_server<F>(&self, id: &str, mutate: F) -> Result<DevServerRecord, StorageError>
    where
        F: FnOnce(&mut DevServerRecord),
    {
        let mut record = self.get_server(id)?;
        mutate(&mut record);
        record.updated_at = Utc::now();
        fs::write(self.server_path(id)?, serde_json::to_string_pretty(&record)?)?;
        Ok(record)
    }

    pub fn delete_server(&self, id: &str) -> Result<(), StorageError> {
        let path = self.server_path(id)?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn list_servers(&self) -> Result<Vec<DevServerRecord>, StorageError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(self.servers_dir())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path).map_err(StorageError::from).and_then(|json| {
                serde_json::from_str::<DevServerRecord>(&json).map_err(StorageError::from)
            }) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping unreadable server record {:?}: {}", path, e),
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    // ---- config ----

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    pub fn load_config(&self) -> Result<AppConfig, StorageError> {
        let config_path = self.config_path();
        if !config_path.exists() {
            let default_config = Self::default_config();
            fs::write(&config_path, serde_json::to_string_pretty(&default_config)?)?;
            return Ok(default_config);
        }
        let json = fs::read_to_string(config_path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn save_config(&self, config: &AppConfig) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(config)?;
        fs::write(self.config_path(), json)?;
        Ok(())
    }

    /// Default config with the built-in provider registry
    fn default_config() -> AppConfig {
        let mut providers = HashMap::new();

        providers.insert(
            "claude".to_string(),
            ProviderConfig {
                command: "claude".to_string(),
                auto_approve_flag: Some("--dangerously-skip-permissions".to_string()),
                model_flag: Some("--model".to_string()),
                default_model: "opus-4-6".to_string(),
                resume_flag: Some("--resume".to_string()),
                print_args: vec![
                    "-p".to_string(),
                    "--output-format".to_string(),
                    "stream-json".to_string(),
                    "--verbose".to_string(),
                ],
                env: None,
                session_prefix: "claude".to_string(),
                ready_patterns: vec![
                    "? for shortcuts".to_string(),
                    "Try \"".to_string(),
                ],
                trust_patterns: vec![
                    "Do you trust the files in this folder?".to_string(),
                    "Yes, proceed".to_string(),
                ],
            },
        );

        providers.insert(
            "codex".to_string(),
            ProviderConfig {
                command: "codex".to_string(),
                auto_approve_flag: Some("--dangerously-bypass-approvals-and-sandbox".to_string()),
                model_flag: Some("-m".to_string()),
                default_model: "gpt-5.3-codex".to_string(),
                resume_flag: None,
                print_args: vec!["exec".to_string(), "--json".to_string()],
                env: None,
                session_prefix: "codex".to_string(),
                ready_patterns: vec!["Ctrl+C to quit".to_string()],
                trust_patterns: vec!["Allow Codex to work in this folder".to_string()],
            },
        );

        AppConfig {
            providers,
            ports: PortConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}
