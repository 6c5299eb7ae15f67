use serde::Serialize;
use serde_json::Value;

/// A structured event decoded from one stream-JSON line of an agent CLI turn.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The agent reported its own internal session id; needed to resume
    /// later turns.
    Init { session_id: String },
    /// Assistant message content, text blocks concatenated in order.
    Text { text: String },
    ToolStart { name: String, input: Value },
    ToolEnd { output: String, is_error: bool },
    Complete {
        duration_ms: Option<u64>,
        result: Option<String>,
    },
    Error { message: String },
}

/// What the parser hands back per completed line: zero or more events, or a
/// parse-error diagnostic. Malformed lines never stop processing.
#[derive(Debug, Clone, PartialEq)]
pub enum ParserSignal {
    Event(AgentEvent),
    ParseError { line: String, error: String },
}

/// Line-oriented buffer turning NDJSON chunks into [`AgentEvent`]s.
///
/// One instance lives per turn; `write` may be called with chunks that split
/// lines at arbitrary byte positions. Events are emitted strictly in the
/// order their source lines completed.
#[derive(Default)]
pub struct StreamParser {
    buffer: String,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the signals for every line completed by it.
    pub fn write(&mut self, chunk: &str) -> Vec<ParserSignal> {
        self.buffer.push_str(chunk);

        let mut signals = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            signals.extend(Self::parse_line(line.trim_end_matches(['\r', '\n'])));
        }
        signals
    }

    /// Flush a non-terminated trailing buffer as a best-effort final line.
    pub fn end(&mut self) -> Vec<ParserSignal> {
        let rest = std::mem::take(&mut self.buffer);
        Self::parse_line(rest.trim())
    }

    fn parse_line(line: &str) -> Vec<ParserSignal> {
        if line.trim().is_empty() {
            return Vec::new();
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                return vec![ParserSignal::ParseError {
                    line: line.to_string(),
                    error: e.to_string(),
                }];
            }
        };

        Self::map_envelope(&value)
            .into_iter()
            .map(ParserSignal::Event)
            .collect()
    }

    /// Map a decoded envelope to client-facing events. Unmapped envelope
    /// types produce nothing; they are not errors.
    fn map_envelope(value: &Value) -> Vec<AgentEvent> {
        match value.get("type").and_then(Value::as_str) {
            Some("system") => {
                if value.get("subtype").and_then(Value::as_str) == Some("init") {
                    if let Some(session_id) = value.get("session_id").and_then(Value::as_str) {
                        return vec![AgentEvent::Init {
                            session_id: session_id.to_string(),
                        }];
                    }
                }
                Vec::new()
            }
            Some("assistant") => Self::map_assistant(value),
            Some("user") => Self::map_tool_results(value),
            Some("result") => vec![Self::map_result(value)],
            _ => Vec::new(),
        }
    }

    fn content_blocks(value: &Value) -> &[Value] {
        value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn map_assistant(value: &Value) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        let mut text = String::new();

        for block in Self::content_blocks(value) {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    let name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    events.push(AgentEvent::ToolStart { name, input });
                }
                _ => {}
            }
        }

        if !text.is_empty() {
            events.insert(0, AgentEvent::Text { text });
        }
        events
    }

    fn map_tool_results(value: &Value) -> Vec<AgentEvent> {
        Self::content_blocks(value)
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
            .map(|block| {
                let output = match block.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                let is_error = block
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                AgentEvent::ToolEnd { output, is_error }
            })
            .collect()
    }

    fn map_result(value: &Value) -> AgentEvent {
        let subtype = value.get("subtype").and_then(Value::as_str);
        if subtype == Some("success") {
            AgentEvent::Complete {
                duration_ms: value.get("duration_ms").and_then(Value::as_u64),
                result: value
                    .get("result")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        } else {
            let message = value
                .get("result")
                .or_else(|| value.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| subtype.unwrap_or("unknown error").to_string());
            AgentEvent::Error { message }
        }
    }
}
