mod cli;

use std::fs::OpenOptions;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::MakeWriterExt;

use cli::{AssessArgs, Cli, Command};
use habitat_warden::config::WardenConfig;
use habitat_warden::policy::EnforcementMode;
use habitat_warden::report::CiOutputs;
use habitat_warden::warden::{self, AssessRequest};

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .warden/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn render_config_human(config: &WardenConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Agent\n");
    push_kv(&mut output, "program", &config.agent.program);
    if config.agent.args.is_empty() {
        push_kv(&mut output, "args", "(none)");
    } else {
        push_kv(&mut output, "args", config.agent.args.join(", "));
    }
    let model = if config.agent.model.is_empty() {
        "(server default)"
    } else {
        config.agent.model.as_str()
    };
    push_kv(&mut output, "model", model);
    push_kv(
        &mut output,
        "client",
        format!("{} {}", config.agent.client_name, config.agent.client_version),
    );
    output.push('\n');

    output.push_str("Timeouts\n");
    push_kv(&mut output, "turn", format!("{}s", config.timeouts.turn_secs));
    push_kv(&mut output, "request", format!("{}s", config.timeouts.request_secs));
    push_kv(&mut output, "rpc_idle", format!("{}s", config.timeouts.rpc_idle_secs));
    push_kv(
        &mut output,
        "progress_log",
        format!("{}s", config.timeouts.progress_log_secs),
    );
    output.push('\n');

    output.push_str("Prompt\n");
    push_kv(&mut output, "max_diff_chars", config.prompt.max_diff_chars);
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn render_config_json(config: &WardenConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    payload["source_path"] = serde_json::json!(config_source_label(config_path));
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

/// Parse an enforcement-mode override. Unknown values are ignored.
fn resolve_mode(raw: Option<&str>) -> Option<EnforcementMode> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty())?;
    match raw.parse() {
        Ok(mode) => Some(mode),
        Err(err) => {
            warn!(%err, "ignoring enforcement mode override");
            None
        }
    }
}

fn apply_overrides(config: &mut WardenConfig, args: &AssessArgs) {
    if let Some(model) = &args.model {
        config.agent.model = model.trim().to_string();
    }
    if let Some(secs) = args.timeout_seconds {
        config.timeouts.turn_secs = secs;
    }
    if let Some(secs) = args.request_timeout_seconds {
        config.timeouts.request_secs = secs;
    }
    if let Some(secs) = args.rpc_idle_timeout_seconds {
        config.timeouts.rpc_idle_secs = secs;
    }
}

fn init_tracing(cli: &Cli, is_config_command: bool) -> Result<()> {
    let filter = match cli.verbose {
        0 if is_config_command => "habitat_warden=warn".to_string(),
        0 => format!("habitat_warden={}", cli.log_level.trim().to_ascii_lowercase()),
        1 => "habitat_warden=debug".to_string(),
        _ => "habitat_warden=trace".to_string(),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match &cli.log_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file: {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::io::stderr.and(Mutex::new(file)))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });
    init_tracing(&cli, is_config_command)?;

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (mut config, config_path) = WardenConfig::load(&cwd)?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .warden/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Assess(args) => {
            apply_overrides(&mut config, &args);
            config.validate()?;

            let request = AssessRequest {
                diff_path: args.diff_path.clone(),
                changed_files_path: args.changed_files_path.clone(),
                policy_path: args.policy_path.clone(),
                schema_path: args.schema_path.clone(),
                output_path: args.output_path.clone(),
                cwd: args.cwd.clone().unwrap_or_else(|| cwd.clone()),
                mode_override: resolve_mode(args.mode.as_deref()),
            };
            let report = warden::execute(&config, &request, &CiOutputs::from_env())?;
            Ok(ExitCode::from(warden::exit_code(report.should_block)))
        }
        Command::Evaluate {
            assessment_path,
            changed_files_path,
            policy_path,
            mode,
        } => {
            let policy = warden::load_policy(&policy_path, resolve_mode(mode.as_deref()))?;
            let decision = warden::evaluate(&assessment_path, &changed_files_path, &policy)?;
            let mut payload =
                serde_json::to_value(&decision).context("failed to serialize decision")?;
            payload["policy_mode"] = serde_json::json!(policy.mode);
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize decision")?
            );
            Ok(ExitCode::from(warden::exit_code(decision.should_block)))
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_config_human_groups_sections_and_formats_arrays() {
        let config = WardenConfig::default();
        let rendered = render_config_human(&config, None);

        assert!(rendered.contains("Agent"));
        assert!(rendered.contains("Timeouts"));
        assert!(rendered.contains("Prompt"));
        assert!(rendered.contains("Source Path"));
        assert!(rendered.contains("app-server, --listen, stdio://"));
        assert!(rendered.contains("240s"));
        assert!(rendered.contains("(defaults, no .warden/config.toml found)"));
    }

    #[test]
    fn render_config_human_marks_server_default_model() {
        let mut config = WardenConfig::default();
        config.agent.model.clear();
        assert!(render_config_human(&config, None).contains("(server default)"));
    }

    #[test]
    fn render_config_json_is_valid_and_contains_expected_fields() {
        let config = WardenConfig::default();
        let json = render_config_json(&config, None).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["agent"]["program"], "codex");
        assert_eq!(value["timeouts"]["request_secs"], 60);
        assert_eq!(value["prompt"]["max_diff_chars"], 120_000);
        assert_eq!(
            value["source_path"],
            "(defaults, no .warden/config.toml found)"
        );
    }

    #[test]
    fn mode_override_ignores_unknown_values() {
        assert_eq!(resolve_mode(Some("ENFORCE")), Some(EnforcementMode::Enforce));
        assert_eq!(resolve_mode(Some("  ")), None);
        assert_eq!(resolve_mode(Some("lenient")), None);
        assert_eq!(resolve_mode(None), None);
    }

    #[test]
    fn cli_overrides_replace_file_values() {
        let cli = Cli::try_parse_from([
            "habitat-warden",
            "assess",
            "--diff-path",
            "d",
            "--changed-files-path",
            "c",
            "--policy-path",
            "p",
            "--schema-path",
            "s",
            "--model",
            "",
            "--timeout-seconds",
            "500",
            "--request-timeout-seconds",
            "45",
            "--rpc-idle-timeout-seconds",
            "2",
        ])
        .unwrap();
        let Command::Assess(args) = cli.command else {
            panic!("expected assess");
        };
        let mut config = WardenConfig::default();
        apply_overrides(&mut config, &args);
        assert!(config.agent.model.is_empty());
        assert_eq!(config.timeouts.turn_secs, 500);
        assert_eq!(config.timeouts.request_secs, 45);
        assert_eq!(config.timeouts.rpc_idle_secs, 2);
        assert!(config.validate().is_ok());
    }
}
