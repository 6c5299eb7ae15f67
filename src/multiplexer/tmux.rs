use std::path::Path;
use std::process::Command;

use super::{Multiplexer, MultiplexerError, MuxSession};

/// tmux adapter shelling out to the local `tmux` binary.
#[derive(Debug, Clone, Default)]
pub struct TmuxMultiplexer;

impl TmuxMultiplexer {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, args: &[&str]) -> Result<String, MultiplexerError> {
        let output = Command::new("tmux").args(args).output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let message = if !stderr.is_empty() { stderr } else { stdout };
            return Err(MultiplexerError::Command(if message.is_empty() {
                "tmux command failed".to_string()
            } else {
                message
            }));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Multiplexer for TmuxMultiplexer {
    fn create_session(
        &self,
        name: &str,
        cwd: &Path,
        command: &str,
    ) -> Result<(), MultiplexerError> {
        let cwd = cwd.to_string_lossy();
        tracing::info!("Creating tmux session {} in {}: {}", name, cwd, command);
        self.run(&["new-session", "-d", "-s", name, "-c", &cwd, command])?;
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<MuxSession>, MultiplexerError> {
        // tmux exits nonzero when the server is not running; that means no
        // sessions, not a failure
        let output = match self.run(&[
            "list-sessions",
            "-F",
            "#{session_name}\t#{session_activity}",
        ]) {
            Ok(output) => output,
            Err(MultiplexerError::Command(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(output
            .lines()
            .filter_map(|line| {
                let mut parts = line.split('\t');
                let name = parts.next()?.trim();
                if name.is_empty() {
                    return None;
                }
                let last_activity = parts.next()?.trim().parse().ok()?;
                Some(MuxSession {
                    name: name.to_string(),
                    last_activity,
                })
            })
            .collect())
    }

    fn session_activity(&self, name: &str) -> Result<i64, MultiplexerError> {
        let output = self.run(&["display-message", "-p", "-t", name, "#{session_activity}"])?;
        output
            .trim()
            .parse()
            .map_err(|_| MultiplexerError::Command(format!("bad activity value: {}", output.trim())))
    }

    fn capture_pane(&self, name: &str, scrollback: u32) -> Result<String, MultiplexerError> {
        let start = format!("-{}", scrollback);
        self.run(&["capture-pane", "-p", "-t", name, "-S", &start])
    }

    fn send_text(&self, name: &str, text: &str) -> Result<(), MultiplexerError> {
        // -l sends the text literally; -- stops option parsing for text that
        // starts with a dash
        self.run(&["send-keys", "-t", name, "-l", "--", text])?;
        Ok(())
    }

    fn send_key(&self, name: &str, key: &str) -> Result<(), MultiplexerError> {
        self.run(&["send-keys", "-t", name, key])?;
        Ok(())
    }

    fn kill_session(&self, name: &str) -> Result<(), MultiplexerError> {
        self.run(&["kill-session", "-t", name])?;
        Ok(())
    }
}
