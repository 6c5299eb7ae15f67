pub mod cli;
pub mod devserver;
pub mod multiplexer;
pub mod orchestrator;
pub mod paths;
pub mod process;
pub mod status;
pub mod storage;
pub mod worktree;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with an env-filtered fmt layer. Call once from the
/// embedding process.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
