//! Generic adapter for any program that already speaks the app-server
//! protocol on stdio (alternate builds, wrappers, test doubles).

use std::path::Path;

use crate::agent::{AgentAdapter, SpawnConfig};

pub struct CommandAdapter {
    program: String,
    args: Vec<String>,
}

impl CommandAdapter {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

impl AgentAdapter for CommandAdapter {
    fn name(&self) -> &str {
        "command"
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
