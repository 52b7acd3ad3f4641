use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::rpc::RpcTimeouts;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".warden";
/// Upper bound for every timeout setting (one week).
const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default = "default_agent_program")]
    pub program: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    /// Model requested on `thread/start`. Empty means the server default.
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
}

fn default_agent_program() -> String {
    "codex".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec![
        "app-server".to_string(),
        "--listen".to_string(),
        "stdio://".to_string(),
    ]
}

fn default_model() -> String {
    "gpt-5.3-codex".to_string()
}

fn default_client_name() -> String {
    "habitat-warden".to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_turn_secs() -> u64 {
    240
}

fn default_request_secs() -> u64 {
    60
}

fn default_rpc_idle_secs() -> u64 {
    5
}

fn default_progress_log_secs() -> u64 {
    15
}

fn default_max_diff_chars() -> usize {
    120_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: default_agent_program(),
            args: default_agent_args(),
            model: default_model(),
            client_name: default_client_name(),
            client_version: default_client_version(),
        }
    }
}

/// Timeout tiers, in seconds.
///
/// ```toml
/// [timeouts]
/// turn_secs = 240
/// request_secs = 60
/// rpc_idle_secs = 5
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TimeoutSettings {
    #[serde(default = "default_turn_secs")]
    pub turn_secs: u64,
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
    #[serde(default = "default_rpc_idle_secs")]
    pub rpc_idle_secs: u64,
    #[serde(default = "default_progress_log_secs")]
    pub progress_log_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            turn_secs: default_turn_secs(),
            request_secs: default_request_secs(),
            rpc_idle_secs: default_rpc_idle_secs(),
            progress_log_secs: default_progress_log_secs(),
        }
    }
}

impl TimeoutSettings {
    pub fn turn(&self) -> Duration {
        Duration::from_secs(self.turn_secs)
    }

    /// The per-RPC tier plus polling cadence. Idle polls are at least 1s.
    pub fn rpc(&self) -> RpcTimeouts {
        RpcTimeouts {
            request: Duration::from_secs(self.request_secs),
            idle: Duration::from_secs(self.rpc_idle_secs.max(1)),
            progress_every: Duration::from_secs(self.progress_log_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PromptSettings {
    #[serde(default = "default_max_diff_chars")]
    pub max_diff_chars: usize,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            max_diff_chars: default_max_diff_chars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct WardenConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub prompt: PromptSettings,
}

impl WardenConfig {
    /// Search upward from `start` for a `.warden/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: WardenConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((WardenConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.program.trim().is_empty() {
            bail!("agent.program must not be empty");
        }
        if self.timeouts.request_secs == 0 {
            bail!("timeouts.request_secs must be positive");
        }
        for (key, secs) in [
            ("turn_secs", self.timeouts.turn_secs),
            ("request_secs", self.timeouts.request_secs),
            ("rpc_idle_secs", self.timeouts.rpc_idle_secs),
            ("progress_log_secs", self.timeouts.progress_log_secs),
        ] {
            if secs > MAX_TIMEOUT_SECS {
                bail!("timeouts.{key} ({secs}) must not exceed {MAX_TIMEOUT_SECS}");
            }
        }
        if self.timeouts.turn_secs <= self.timeouts.request_secs {
            bail!(
                "timeouts.turn_secs ({}) must exceed timeouts.request_secs ({})",
                self.timeouts.turn_secs,
                self.timeouts.request_secs
            );
        }
        if self.prompt.max_diff_chars == 0 {
            bail!("prompt.max_diff_chars must be positive");
        }
        Ok(())
    }
}
