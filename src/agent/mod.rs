//! Agent adapter layer.
//!
//! The warden talks to any program that serves the app-server JSON-RPC
//! protocol on its stdio. An adapter only knows how to build the command line
//! for one such program; the transport owns the process once it is spawned.

pub mod codex;
pub mod command;

use std::path::Path;

use crate::config::AgentConfig;

/// Configuration for spawning an agent process.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnConfig {
    /// The program to execute (e.g., "codex").
    pub program: String,
    /// Arguments to pass to the program.
    pub args: Vec<String>,
    /// Working directory for the agent process. Empty means inherit ours.
    pub work_dir: String,
    /// Environment variables to set (key, value pairs).
    pub env: Vec<(String, String)>,
}

/// Trait that all agent adapters must implement.
pub trait AgentAdapter {
    /// Human-readable name of the agent (e.g., "codex-app-server").
    fn name(&self) -> &str;

    /// Build the spawn configuration for an agent rooted at `work_dir`.
    fn spawn_config(&self, work_dir: &Path) -> SpawnConfig;
}

/// Pick the adapter for the configured agent program.
///
/// Anything whose file name is `codex` gets the app-server adapter; every
/// other program is launched verbatim.
pub fn adapter_for(config: &AgentConfig) -> Box<dyn AgentAdapter> {
    let file_name = Path::new(&config.program)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    if file_name == "codex" {
        Box::new(codex::CodexAppServerAdapter::new(
            Some(config.program.clone()),
            config.args.clone(),
        ))
    } else {
        Box::new(command::CommandAdapter::new(
            config.program.clone(),
            config.args.clone(),
        ))
    }
}
