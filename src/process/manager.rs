use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use super::parser::{AgentEvent, ParserSignal, StreamParser};
use crate::cli::{ProviderRegistry, RegistryError};
use crate::storage::{MessageRecord, SessionStatus, Storage, StorageError};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("A turn is already running for session: {0}")]
    TurnInProgress(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Serialized event delivered to observer sinks.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Status {
        session_id: String,
        status: SessionStatus,
    },
    Agent {
        session_id: String,
        event: AgentEvent,
    },
    ParseError {
        session_id: String,
        line: String,
        error: String,
    },
}

pub type ClientSink = mpsc::UnboundedSender<ClientEvent>;

#[derive(Debug, Clone, Default)]
pub struct SendPromptOptions {
    pub model: Option<String>,
}

/// In-memory coordination state for one session while observers are attached
/// or a turn is active. Never persisted; storage stays authoritative.
struct ManagedSession {
    status: SessionStatus,
    clients: HashMap<String, ClientSink>,
    /// PID of the live turn process, if any.
    pid: Option<u32>,
    /// Turn slot: true from send_prompt reservation until the exit handler
    /// clears it. Enforces at most one concurrent turn per session.
    active: bool,
}

impl ManagedSession {
    fn new() -> Self {
        Self {
            status: SessionStatus::Idle,
            clients: HashMap::new(),
            pid: None,
            active: false,
        }
    }
}

struct ProcessManagerInner {
    storage: Arc<Storage>,
    registry: ProviderRegistry,
    sessions: RwLock<HashMap<String, ManagedSession>>,
}

/// One authoritative in-memory table of managed sessions, keyed by session id.
///
/// Owns at most one OS process per session, feeds its stdout through a
/// [`StreamParser`], re-broadcasts events to all subscribed observers in
/// order, and applies the event-to-persistence mapping.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<ProcessManagerInner>,
}

impl ProcessManager {
    pub fn new(storage: Arc<Storage>, registry: ProviderRegistry) -> Self {
        Self {
            inner: Arc::new(ProcessManagerInner {
                storage,
                registry,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Attach an observer sink. Lazily creates the in-memory entry and
    /// immediately sends the sink a synthetic status event so new observers
    /// never have to guess current state. Returns the client id.
    pub fn register_client(&self, session_id: &str, sink: ClientSink) -> String {
        let client_id = Uuid::new_v4().to_string();
        let mut sessions = self.inner.sessions.write();
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(ManagedSession::new);

        let _ = sink.send(ClientEvent::Status {
            session_id: session_id.to_string(),
            status: entry.status,
        });
        entry.clients.insert(client_id.clone(), sink);
        client_id
    }

    /// Channel-based convenience over `register_client`.
    pub fn subscribe(&self, session_id: &str) -> (String, UnboundedReceiverStream<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client_id = self.register_client(session_id, tx);
        (client_id, UnboundedReceiverStream::new(rx))
    }

    /// Detach an observer. The entry is torn down once no observers remain
    /// and no process is running, bounding memory growth across long uptimes.
    pub fn unregister_client(&self, session_id: &str, client_id: &str) {
        let mut sessions = self.inner.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.clients.remove(client_id);
            if entry.clients.is_empty() && !entry.active {
                sessions.remove(session_id);
            }
        }
    }

    pub fn get_session_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.inner.sessions.read().get(session_id).map(|e| e.status)
    }

    /// Start a new turn.
    ///
    /// The only hard failures are the synchronous preconditions (unknown
    /// session, turn already running, unknown provider). Spawn and IO errors
    /// are converted into `status: error` broadcasts instead of propagating.
    pub async fn send_prompt(
        &self,
        session_id: &str,
        prompt: &str,
        options: SendPromptOptions,
    ) -> Result<(), ProcessError> {
        // Reserve the turn slot under the write lock, before any await point
        {
            let mut sessions = self.inner.sessions.write();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| ProcessError::SessionNotFound(session_id.to_string()))?;
            if entry.active {
                return Err(ProcessError::TurnInProgress(session_id.to_string()));
            }
            entry.active = true;
        }

        match self.start_turn(session_id, prompt, options).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.release_turn_slot(session_id);
                Err(e)
            }
        }
    }

    async fn start_turn(
        &self,
        session_id: &str,
        prompt: &str,
        options: SendPromptOptions,
    ) -> Result<(), ProcessError> {
        let record = self.inner.storage.get_session(session_id)?;

        let turn_id = Uuid::new_v4().to_string();
        let user_message = MessageRecord::new(&format!("{}-user", turn_id), "user", prompt);
        self.inner.storage.append_message(session_id, &user_message)?;

        let model = options.model.or_else(|| record.model.clone());
        let built = self.inner.registry.build_turn_command(
            &record.agent_type,
            model.as_deref(),
            record.auto_approve,
            record.resume_id.as_deref(),
            prompt,
        )?;

        let cwd = record
            .worktree_path
            .clone()
            .unwrap_or_else(|| record.working_dir.clone());

        tracing::info!(
            "Starting turn for session {}: {} {:?} in {}",
            session_id,
            built.command,
            built.args,
            cwd
        );

        let mut cmd = Command::new(&built.command);
        cmd.args(&built.args)
            .envs(&built.env)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("Failed to spawn agent process for {}: {}", session_id, e);
                self.inner.finish_turn(session_id, SessionStatus::Error);
                return Ok(());
            }
        };

        {
            let mut sessions = self.inner.sessions.write();
            if let Some(entry) = sessions.get_mut(session_id) {
                entry.pid = child.id();
            }
        }
        let _ = self
            .inner
            .storage
            .update_session(session_id, |s| s.status = SessionStatus::Running);
        self.inner.set_status(session_id, SessionStatus::Running);

        let inner = Arc::clone(&self.inner);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            inner.run_turn(&session_id, &turn_id, child).await;
        });

        Ok(())
    }

    /// Send a termination signal to the live turn process, if any. No-op
    /// otherwise; final state settles through the exit handler.
    pub fn cancel_session(&self, session_id: &str) {
        let pid = self
            .inner
            .sessions
            .read()
            .get(session_id)
            .and_then(|e| e.pid);
        if let Some(pid) = pid {
            tracing::info!("Cancelling session {} (pid {})", session_id, pid);
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
}

impl ProcessManagerInner {
    fn set_status(&self, session_id: &str, status: SessionStatus) {
        let event = ClientEvent::Status {
            session_id: session_id.to_string(),
            status,
        };
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.status = status;
            entry.clients.retain(|_, sink| sink.send(event.clone()).is_ok());
        }
    }

    fn broadcast(&self, session_id: &str, event: ClientEvent) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.clients.retain(|_, sink| sink.send(event.clone()).is_ok());
        }
    }

    fn release_turn_slot(&self, session_id: &str) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.active = false;
            entry.pid = None;
        }
    }

    /// Settle a finished (or never-started) turn: clear the process slot,
    /// persist the final status, broadcast it, and GC the entry if no
    /// observers remain.
    fn finish_turn(&self, session_id: &str, status: SessionStatus) {
        self.release_turn_slot(session_id);
        let _ = self.storage.update_session(session_id, |s| s.status = status);
        self.set_status(session_id, status);

        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get(session_id) {
            if entry.clients.is_empty() && !entry.active {
                sessions.remove(session_id);
            }
        }
    }

    async fn run_turn(&self, session_id: &str, turn_id: &str, mut child: Child) {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Drain stderr concurrently so the child never blocks on a full pipe
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let mut parser = StreamParser::new();
        let mut seq: u64 = 0;

        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        for signal in parser.write(&format!("{}\n", line)) {
                            self.handle_signal(session_id, turn_id, &mut seq, signal);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Error reading agent stdout for {}: {}", session_id, e);
                        break;
                    }
                }
            }
        }

        for signal in parser.end() {
            self.handle_signal(session_id, turn_id, &mut seq, signal);
        }

        let exit = child.wait().await;
        let exit_ok = matches!(&exit, Ok(status) if status.success());
        if !exit_ok {
            let stderr_text = stderr_task.await.unwrap_or_default();
            tracing::warn!(
                "Agent process for {} ended abnormally ({:?}): {}",
                session_id,
                exit,
                stderr_text.trim()
            );
        } else {
            let _ = stderr_task.await;
        }

        let final_status = if exit_ok {
            SessionStatus::Idle
        } else {
            SessionStatus::Error
        };
        self.finish_turn(session_id, final_status);
    }

    fn handle_signal(
        &self,
        session_id: &str,
        turn_id: &str,
        seq: &mut u64,
        signal: ParserSignal,
    ) {
        match signal {
            ParserSignal::Event(event) => {
                self.apply_event(session_id, turn_id, *seq, &event);
                *seq += 1;
                self.broadcast(
                    session_id,
                    ClientEvent::Agent {
                        session_id: session_id.to_string(),
                        event,
                    },
                );
            }
            ParserSignal::ParseError { line, error } => {
                tracing::warn!("Unparseable agent output for {}: {}", session_id, error);
                self.broadcast(
                    session_id,
                    ClientEvent::ParseError {
                        session_id: session_id.to_string(),
                        line,
                        error,
                    },
                );
            }
        }
    }

    /// The one place events cross from transient to durable state. Message
    /// ids derive from (turn, sequence) so a replayed event cannot duplicate
    /// rows; storage errors here are logged, never propagated.
    fn apply_event(&self, session_id: &str, turn_id: &str, seq: u64, event: &AgentEvent) {
        match event {
            AgentEvent::Init { session_id: resume_id } => {
                let resume_id = resume_id.clone();
                if let Err(e) = self.storage.update_session(session_id, |s| {
                    s.resume_id = Some(resume_id);
                }) {
                    tracing::warn!("Failed to store resume id for {}: {}", session_id, e);
                }
            }
            AgentEvent::Text { text } => {
                let message =
                    MessageRecord::new(&format!("{}-{}", turn_id, seq), "assistant", text);
                if let Err(e) = self.storage.append_message(session_id, &message) {
                    tracing::warn!("Failed to persist assistant message for {}: {}", session_id, e);
                }
            }
            AgentEvent::Complete { .. } => {
                let _ = self
                    .storage
                    .update_session(session_id, |s| s.status = SessionStatus::Idle);
            }
            AgentEvent::Error { message } => {
                tracing::warn!("Agent turn error for {}: {}", session_id, message);
                let _ = self
                    .storage
                    .update_session(session_id, |s| s.status = SessionStatus::Error);
            }
            AgentEvent::ToolStart { .. } | AgentEvent::ToolEnd { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ProviderConfig, SessionRecord};
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_stream::StreamExt;

    fn fake_provider(command: &str, print_args: Vec<&str>) -> ProviderConfig {
        ProviderConfig {
            command: command.to_string(),
            auto_approve_flag: None,
            model_flag: None,
            default_model: "test".to_string(),
            resume_flag: None,
            print_args: print_args.into_iter().map(str::to_string).collect(),
            env: None,
            session_prefix: "fake".to_string(),
            ready_patterns: vec![],
            trust_patterns: vec![],
        }
    }

    fn setup(provider: ProviderConfig) -> (TempDir, Arc<Storage>, ProcessManager) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new_with_base(dir.path().to_path_buf()).unwrap());

        let mut providers = StdHashMap::new();
        providers.insert("fake".to_string(), provider);
        let manager = ProcessManager::new(Arc::clone(&storage), ProviderRegistry::new(providers));

        let record = SessionRecord::new("s1", "test session", dir.path().to_str().unwrap(), "fake");
        storage.create_session(&record).unwrap();

        (dir, storage, manager)
    }

    #[tokio::test]
    async fn test_send_prompt_requires_registered_session() {
        // Prompt lands in $1 of the sh invocation and is ignored
        let (_dir, _storage, manager) = setup(fake_provider("sh", vec!["-c", "sleep 0.2", "sh"]));

        let err = manager
            .send_prompt("s1", "hello", SendPromptOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_at_most_one_turn_per_session() {
        let (_dir, _storage, manager) = setup(fake_provider("sh", vec!["-c", "sleep 0.4", "sh"]));
        let (_client, _events) = manager.subscribe("s1");

        manager
            .send_prompt("s1", "first", SendPromptOptions::default())
            .await
            .unwrap();

        let err = manager
            .send_prompt("s1", "second", SendPromptOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::TurnInProgress(_)));

        // After the first process closes, a new turn is permitted
        tokio::time::sleep(Duration::from_millis(800)).await;
        manager
            .send_prompt("s1", "third", SendPromptOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_turn_events_broadcast_in_order_and_persisted() {
        let script = r#"printf '%s\n' '{"type":"system","subtype":"init","session_id":"inner-1"}' '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}' '{"type":"result","subtype":"success","duration_ms":5}'"#;
        let (_dir, storage, manager) = setup(fake_provider("sh", vec!["-c", script, "sh"]));

        let (_client, events) = manager.subscribe("s1");
        manager
            .send_prompt("s1", "go", SendPromptOptions::default())
            .await
            .unwrap();

        let collected: Vec<ClientEvent> = tokio::time::timeout(
            Duration::from_secs(5),
            events.take(5).collect::<Vec<_>>(),
        )
        .await
        .expect("turn did not complete in time");

        assert_eq!(
            collected[0],
            ClientEvent::Status {
                session_id: "s1".to_string(),
                status: SessionStatus::Idle
            }
        );
        assert_eq!(
            collected[1],
            ClientEvent::Status {
                session_id: "s1".to_string(),
                status: SessionStatus::Running
            }
        );
        assert!(matches!(
            collected[2],
            ClientEvent::Agent {
                event: AgentEvent::Init { .. },
                ..
            }
        ));
        assert!(matches!(
            collected[3],
            ClientEvent::Agent {
                event: AgentEvent::Text { .. },
                ..
            }
        ));
        assert!(matches!(
            collected[4],
            ClientEvent::Agent {
                event: AgentEvent::Complete { .. },
                ..
            }
        ));

        // Give the exit handler a beat to settle persistent state
        tokio::time::sleep(Duration::from_millis(200)).await;
        let record = storage.get_session("s1").unwrap();
        assert_eq!(record.resume_id.as_deref(), Some("inner-1"));
        assert_eq!(record.status, SessionStatus::Idle);

        let messages = storage.read_messages("s1", None).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "hi");
    }

    #[tokio::test]
    async fn test_spawn_failure_becomes_error_status_not_err() {
        let (_dir, storage, manager) =
            setup(fake_provider("/nonexistent/agent-binary-xyz", vec![]));

        let (_client, mut events) = manager.subscribe("s1");
        manager
            .send_prompt("s1", "go", SendPromptOptions::default())
            .await
            .expect("spawn failure must not propagate");

        let mut saw_error = false;
        for _ in 0..3 {
            match tokio::time::timeout(Duration::from_secs(2), events.next()).await {
                Ok(Some(ClientEvent::Status {
                    status: SessionStatus::Error,
                    ..
                })) => {
                    saw_error = true;
                    break;
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_error);
        assert_eq!(storage.get_session("s1").unwrap().status, SessionStatus::Error);

        // The slot is released; the next turn may start
        assert!(matches!(
            manager.get_session_status("s1"),
            Some(SessionStatus::Error)
        ));
        manager
            .send_prompt("s1", "retry", SendPromptOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unregister_gc_removes_idle_entry() {
        let (_dir, _storage, manager) = setup(fake_provider("sh", vec!["-c", "true", "sh"]));
        let (client_id, _events) = manager.subscribe("s1");
        assert!(manager.get_session_status("s1").is_some());

        manager.unregister_client("s1", &client_id);
        assert!(manager.get_session_status("s1").is_none());
    }
}
