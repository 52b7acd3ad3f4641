//! Codex app-server adapter.
//!
//! Runs `codex app-server --listen stdio://` so the JSON-RPC session happens
//! on the child's stdin/stdout.

use std::path::Path;

use crate::agent::{AgentAdapter, SpawnConfig};

/// Arguments that put codex into stdio app-server mode.
pub const APP_SERVER_ARGS: [&str; 3] = ["app-server", "--listen", "stdio://"];

/// Adapter for the Codex app server.
pub struct CodexAppServerAdapter {
    /// Override the codex binary name/path (default: "codex").
    program: String,
    args: Vec<String>,
}

impl CodexAppServerAdapter {
    /// Empty `args` falls back to [`APP_SERVER_ARGS`].
    pub fn new(program: Option<String>, args: Vec<String>) -> Self {
        let args = if args.is_empty() {
            APP_SERVER_ARGS.iter().map(|a| a.to_string()).collect()
        } else {
            args
        };
        Self {
            program: program.unwrap_or_else(|| "codex".to_string()),
            args,
        }
    }
}

impl AgentAdapter for CodexAppServerAdapter {
    fn name(&self) -> &str {
        "codex-app-server"
    }

    fn spawn_config(&self, work_dir: &Path) -> SpawnConfig {
        SpawnConfig {
            program: self.program.clone(),
            args: self.args.clone(),
            work_dir: work_dir.to_string_lossy().to_string(),
            env: vec![],
        }
    }
}
