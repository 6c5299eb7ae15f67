mod tmux;

pub use tmux::TmuxMultiplexer;

use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MultiplexerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Multiplexer command failed: {0}")]
    Command(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

/// A live multiplexer session: name plus the multiplexer-maintained last
/// activity timestamp (unix seconds, monotonically non-decreasing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxSession {
    pub name: String,
    pub last_activity: i64,
}

/// Terminal-multiplexer operations the engine depends on.
///
/// Every call may fail because the session no longer exists; callers treat
/// that as "already gone", not an error.
pub trait Multiplexer: Send + Sync {
    /// Create a named, detached session running `command` as its foreground
    /// process in `cwd`.
    fn create_session(&self, name: &str, cwd: &Path, command: &str)
        -> Result<(), MultiplexerError>;

    fn list_sessions(&self) -> Result<Vec<MuxSession>, MultiplexerError>;

    /// Current activity timestamp for one session; fetched fresh, unlike the
    /// liveness listing which callers may cache.
    fn session_activity(&self, name: &str) -> Result<i64, MultiplexerError> {
        self.list_sessions()?
            .into_iter()
            .find(|s| s.name == name)
            .map(|s| s.last_activity)
            .ok_or_else(|| MultiplexerError::SessionNotFound(name.to_string()))
    }

    /// Rendered pane text including up to `scrollback` lines of history.
    fn capture_pane(&self, name: &str, scrollback: u32) -> Result<String, MultiplexerError>;

    /// Send text as literal keystrokes (no key-name interpretation).
    fn send_text(&self, name: &str, text: &str) -> Result<(), MultiplexerError>;

    /// Send a named key (e.g. "Enter", "Escape").
    fn send_key(&self, name: &str, key: &str) -> Result<(), MultiplexerError>;

    fn kill_session(&self, name: &str) -> Result<(), MultiplexerError>;

    fn has_session(&self, name: &str) -> bool {
        self.list_sessions()
            .map(|sessions| sessions.iter().any(|s| s.name == name))
            .unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default, Clone)]
    pub struct FakeSession {
        pub pane: String,
        pub activity: i64,
        pub command: String,
        pub sent_text: Vec<String>,
        pub sent_keys: Vec<String>,
    }

    /// In-memory multiplexer double; tests mutate pane text and activity
    /// timestamps directly.
    #[derive(Default)]
    pub struct FakeMultiplexer {
        pub sessions: Mutex<HashMap<String, FakeSession>>,
        pub fail_creates: Mutex<bool>,
        pub fail_captures: Mutex<bool>,
    }

    impl FakeMultiplexer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_session(&self, name: &str) {
            self.sessions
                .lock()
                .insert(name.to_string(), FakeSession::default());
        }

        pub fn set_pane(&self, name: &str, pane: &str) {
            if let Some(s) = self.sessions.lock().get_mut(name) {
                s.pane = pane.to_string();
            }
        }

        pub fn set_activity(&self, name: &str, activity: i64) {
            if let Some(s) = self.sessions.lock().get_mut(name) {
                s.activity = activity;
            }
        }

        pub fn remove_session(&self, name: &str) {
            self.sessions.lock().remove(name);
        }

        pub fn sent_text(&self, name: &str) -> Vec<String> {
            self.sessions
                .lock()
                .get(name)
                .map(|s| s.sent_text.clone())
                .unwrap_or_default()
        }

        pub fn sent_keys(&self, name: &str) -> Vec<String> {
            self.sessions
                .lock()
                .get(name)
                .map(|s| s.sent_keys.clone())
                .unwrap_or_default()
        }
    }

    impl Multiplexer for FakeMultiplexer {
        fn create_session(
            &self,
            name: &str,
            _cwd: &Path,
            command: &str,
        ) -> Result<(), MultiplexerError> {
            if *self.fail_creates.lock() {
                return Err(MultiplexerError::Command("create failed".to_string()));
            }
            let mut sessions = self.sessions.lock();
            sessions.insert(
                name.to_string(),
                FakeSession {
                    command: command.to_string(),
                    ..FakeSession::default()
                },
            );
            Ok(())
        }

        fn list_sessions(&self) -> Result<Vec<MuxSession>, MultiplexerError> {
            Ok(self
                .sessions
                .lock()
                .iter()
                .map(|(name, s)| MuxSession {
                    name: name.clone(),
                    last_activity: s.activity,
                })
                .collect())
        }

        fn session_activity(&self, name: &str) -> Result<i64, MultiplexerError> {
            self.sessions
                .lock()
                .get(name)
                .map(|s| s.activity)
                .ok_or_else(|| MultiplexerError::SessionNotFound(name.to_string()))
        }

        fn capture_pane(&self, name: &str, _scrollback: u32) -> Result<String, MultiplexerError> {
            if *self.fail_captures.lock() {
                return Err(MultiplexerError::Command("capture failed".to_string()));
            }
            self.sessions
                .lock()
                .get(name)
                .map(|s| s.pane.clone())
                .ok_or_else(|| MultiplexerError::SessionNotFound(name.to_string()))
        }

        fn send_text(&self, name: &str, text: &str) -> Result<(), MultiplexerError> {
            self.sessions
                .lock()
                .get_mut(name)
                .map(|s| s.sent_text.push(text.to_string()))
                .ok_or_else(|| MultiplexerError::SessionNotFound(name.to_string()))
        }

        fn send_key(&self, name: &str, key: &str) -> Result<(), MultiplexerError> {
            self.sessions
                .lock()
                .get_mut(name)
                .map(|s| s.sent_keys.push(key.to_string()))
                .ok_or_else(|| MultiplexerError::SessionNotFound(name.to_string()))
        }

        fn kill_session(&self, name: &str) -> Result<(), MultiplexerError> {
            self.sessions
                .lock()
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| MultiplexerError::SessionNotFound(name.to_string()))
        }
    }
}
