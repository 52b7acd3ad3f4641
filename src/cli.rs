use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "habitat-warden",
    about = "Risk-assess a pull request diff with a coding agent and enforce policy on the verdict",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log level when no -v is given (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "WARDEN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Also append logs to this file
    #[arg(long, global = true, env = "WARDEN_LOG_PATH")]
    pub log_path: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a full assessment against the agent and apply policy
    Assess(AssessArgs),

    /// Apply policy to a stored assessment without running the agent
    Evaluate {
        /// Assessment JSON, or a run report containing one
        #[arg(long)]
        assessment_path: PathBuf,

        /// Changed files, one path per line
        #[arg(long)]
        changed_files_path: PathBuf,

        /// Policy JSON file
        #[arg(long)]
        policy_path: PathBuf,

        /// Override the policy's enforcement mode (advisory, enforce)
        #[arg(long, env = "WARDEN_ENFORCEMENT_MODE")]
        mode: Option<String>,
    },

    /// Show resolved configuration
    Config {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
pub struct AssessArgs {
    /// Unified diff to review
    #[arg(long)]
    pub diff_path: PathBuf,

    /// Changed files, one path per line
    #[arg(long)]
    pub changed_files_path: PathBuf,

    /// Policy JSON file
    #[arg(long)]
    pub policy_path: PathBuf,

    /// JSON Schema the agent's final answer must match
    #[arg(long)]
    pub schema_path: PathBuf,

    /// Where to write the run report
    #[arg(long, default_value = "assessment.json")]
    pub output_path: PathBuf,

    /// Repository root for the agent (default: current directory)
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Override the configured model (empty string uses the server default)
    #[arg(long, env = "WARDEN_MODEL")]
    pub model: Option<String>,

    /// Per-turn timeout in seconds
    #[arg(long, env = "WARDEN_TIMEOUT_SECONDS")]
    pub timeout_seconds: Option<u64>,

    /// Per-request timeout in seconds
    #[arg(long, env = "WARDEN_REQUEST_TIMEOUT_SECONDS")]
    pub request_timeout_seconds: Option<u64>,

    /// Longest single poll while waiting, in seconds
    #[arg(long, env = "WARDEN_RPC_IDLE_TIMEOUT_SECONDS")]
    pub rpc_idle_timeout_seconds: Option<u64>,

    /// Override the policy's enforcement mode (advisory, enforce)
    #[arg(long, env = "WARDEN_ENFORCEMENT_MODE")]
    pub mode: Option<String>,
}
