//! Top-level assessment run.
//!
//! Input loading errors are the caller's problem (bad policy file, missing
//! diff). Once inputs are loaded, every failure in the agent pipeline is
//! absorbed here: the fail-safe assessment stands in, the reason lands in the
//! report, and the policy engine still runs. A run that gets this far always
//! produces a decision artifact.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::agent;
use crate::assessment::Assessment;
use crate::config::WardenConfig;
use crate::policy::{self, EnforcementMode, PolicyConfig, PolicyDecision};
use crate::prompt;
use crate::report::{CiOutputs, RunReport};
use crate::rpc::{AppServerClient, ChildTransport};
use crate::session::{self, AssessmentOutcome, SessionParams};

/// File locations for one `assess` run.
#[derive(Debug, Clone)]
pub struct AssessRequest {
    pub diff_path: PathBuf,
    pub changed_files_path: PathBuf,
    pub policy_path: PathBuf,
    pub schema_path: PathBuf,
    pub output_path: PathBuf,
    /// Repository root handed to the agent.
    pub cwd: PathBuf,
    pub mode_override: Option<EnforcementMode>,
}

/// Everything read from disk before the agent starts.
#[derive(Debug, Clone)]
pub struct RunInputs {
    pub policy: PolicyConfig,
    pub changed_files: Vec<String>,
    /// Already clipped.
    pub diff: String,
    pub output_schema: Value,
}

impl RunInputs {
    pub fn load(request: &AssessRequest, config: &WardenConfig) -> Result<Self> {
        let policy = load_policy(&request.policy_path, request.mode_override)?;
        let changed_files = policy::read_changed_files(&request.changed_files_path)?;
        let diff = std::fs::read_to_string(&request.diff_path)
            .with_context(|| format!("failed to read diff {}", request.diff_path.display()))?;
        let schema_text = std::fs::read_to_string(&request.schema_path)
            .with_context(|| format!("failed to read schema {}", request.schema_path.display()))?;
        let output_schema: Value = serde_json::from_str(&schema_text)
            .with_context(|| format!("failed to parse schema {}", request.schema_path.display()))?;

        Ok(Self {
            policy,
            changed_files,
            diff: prompt::clip_diff(&diff, config.prompt.max_diff_chars),
            output_schema,
        })
    }
}

/// Load a policy file and apply an optional mode override.
pub fn load_policy(path: &Path, mode_override: Option<EnforcementMode>) -> Result<PolicyConfig> {
    let mut policy = PolicyConfig::load(path)?;
    if let Some(mode) = mode_override {
        policy.mode = mode;
    }
    Ok(policy)
}

/// Load inputs, run the agent, apply policy, and publish the result.
pub fn execute(config: &WardenConfig, request: &AssessRequest, ci: &CiOutputs) -> Result<RunReport> {
    let inputs = RunInputs::load(request, config)?;
    info!(
        model = %config.agent.model,
        turn_timeout_secs = config.timeouts.turn_secs,
        request_timeout_secs = config.timeouts.request_secs,
        idle_timeout_secs = config.timeouts.rpc_idle_secs,
        changed_files = inputs.changed_files.len(),
        "starting habitat warden run"
    );

    let report = run(config, &inputs, &request.cwd);
    report.write(&request.output_path)?;
    if let Err(err) = ci.emit(&report) {
        warn!("failed to publish CI outputs: {err:#}");
    }

    info!(
        verdict = %report.final_verdict,
        should_block = report.should_block,
        requires_approval = report.requires_approval,
        fail_safe = report.fail_safe,
        "habitat warden completed"
    );
    Ok(report)
}

/// Produce a decision from loaded inputs. Never fails.
pub fn run(config: &WardenConfig, inputs: &RunInputs, cwd: &Path) -> RunReport {
    let outcome = assess(config, inputs, cwd);
    decide(outcome, &inputs.changed_files, &inputs.policy)
}

fn assess(config: &WardenConfig, inputs: &RunInputs, cwd: &Path) -> Result<AssessmentOutcome> {
    let adapter = agent::adapter_for(&config.agent);
    let spawn = adapter.spawn_config(cwd);
    info!(agent = adapter.name(), program = %spawn.program, "launching agent");

    let transport = ChildTransport::spawn(&spawn)?;
    let mut client = AppServerClient::new(transport, config.timeouts.rpc());

    let params = SessionParams {
        client_name: config.agent.client_name.clone(),
        client_version: config.agent.client_version.clone(),
        model: config.agent.model.clone(),
        cwd: cwd.to_path_buf(),
        turn_timeout: config.timeouts.turn(),
        prompt: prompt::build_prompt(&inputs.diff, &inputs.changed_files, &inputs.policy),
        output_schema: inputs.output_schema.clone(),
    };
    Ok(session::run_assessment(&mut client, &params)?)
}

/// Apply policy to an assessment outcome, substituting the fail-safe
/// assessment for a failed one.
pub fn decide(
    outcome: Result<AssessmentOutcome>,
    changed_files: &[String],
    policy: &PolicyConfig,
) -> RunReport {
    let (assessment, repair_turn_used, failure) = match outcome {
        Ok(outcome) => (outcome.assessment, outcome.repair_turn_used, None),
        Err(err) => {
            error!("assessment failed; using fail-safe assessment: {err:#}");
            (Assessment::fail_safe(), false, Some(format!("{err:#}")))
        }
    };

    let mut decision = policy::apply_policy(&assessment, changed_files, policy);
    if let Some(reason) = &failure {
        decision.reasons.push(format!("Fail-safe triggered: {reason}"));
    }

    RunReport::new(
        assessment,
        policy.mode,
        decision,
        failure.is_some(),
        repair_turn_used,
    )
}

/// Run only the policy engine over a stored assessment.
///
/// `assessment_path` may hold a bare assessment or a run report containing
/// one under `assessment`.
pub fn evaluate(
    assessment_path: &Path,
    changed_files_path: &Path,
    policy: &PolicyConfig,
) -> Result<PolicyDecision> {
    let text = std::fs::read_to_string(assessment_path)
        .with_context(|| format!("failed to read assessment {}", assessment_path.display()))?;
    let mut value: Value = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse {}", assessment_path.display()))?;
    if let Some(inner) = value.get_mut("assessment").map(Value::take) {
        value = inner;
    }
    let assessment = Assessment::from_value(value)
        .with_context(|| format!("{} is not a valid assessment", assessment_path.display()))?;
    let changed_files = policy::read_changed_files(changed_files_path)?;
    Ok(policy::apply_policy(&assessment, &changed_files, policy))
}

/// Process exit code for a decision.
pub fn exit_code(should_block: bool) -> u8 {
    u8::from(should_block)
}
