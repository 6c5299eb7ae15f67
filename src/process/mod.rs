mod manager;
mod parser;

pub use manager::{
    ClientEvent, ClientSink, ProcessError, ProcessManager, SendPromptOptions,
};
pub use parser::{AgentEvent, ParserSignal, StreamParser};
