//! Run artifact and CI step outputs.
//!
//! Every run ends by writing one pretty-printed JSON document, whether the
//! verdict came from the agent or from the fail-safe path. Downstream
//! aggregation relies on the field set staying stable.
//!
//! When the run happens inside GitHub Actions the same information is also
//! appended to the step's output file (key=value lines plus a heredoc block
//! for the full JSON) and to the job summary as markdown.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use crate::assessment::{Assessment, RegulatoryVerdict};
use crate::policy::{EnforcementMode, PolicyDecision};

const HEREDOC_MARKER: &str = "__WARDEN_EOF__";

/// The persisted decision document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub assessment: Assessment,
    pub policy_mode: EnforcementMode,
    pub final_verdict: RegulatoryVerdict,
    pub requires_approval: bool,
    pub critical_habitat_touched: bool,
    pub should_block: bool,
    pub denial_reason: String,
    pub reasons: Vec<String>,
    /// The assessment is the fail-safe stand-in, not the agent's answer.
    pub fail_safe: bool,
    pub repair_turn_used: bool,
    /// RFC 3339 timestamp.
    pub generated_at: String,
}

impl RunReport {
    pub fn new(
        assessment: Assessment,
        mode: EnforcementMode,
        decision: PolicyDecision,
        fail_safe: bool,
        repair_turn_used: bool,
    ) -> Self {
        Self {
            assessment,
            policy_mode: mode,
            final_verdict: decision.final_verdict,
            requires_approval: decision.requires_approval,
            critical_habitat_touched: decision.critical_habitat_touched,
            should_block: decision.should_block,
            denial_reason: decision.denial_reason,
            reasons: decision.reasons,
            fail_safe,
            repair_turn_used,
            generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn to_pretty_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize run report")
    }

    /// Write the artifact, creating parent directories as needed.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory: {}", parent.display()))?;
        }
        let mut json = self.to_pretty_json()?;
        json.push('\n');
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report: {}", path.display()))?;
        debug!(path = %path.display(), "run report written");
        Ok(())
    }
}

/// Where to publish CI step outputs. Both paths are optional.
#[derive(Debug, Clone, Default)]
pub struct CiOutputs {
    pub output_path: Option<PathBuf>,
    pub summary_path: Option<PathBuf>,
}

impl CiOutputs {
    /// Read `GITHUB_OUTPUT` / `GITHUB_STEP_SUMMARY`; empty values count as unset.
    pub fn from_env() -> Self {
        let path = |name: &str| {
            std::env::var_os(name)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };
        Self {
            output_path: path("GITHUB_OUTPUT"),
            summary_path: path("GITHUB_STEP_SUMMARY"),
        }
    }

    pub fn emit(&self, report: &RunReport) -> Result<()> {
        if self.output_path.is_none() && self.summary_path.is_none() {
            return Ok(());
        }
        let json = report.to_pretty_json()?;

        if let Some(path) = &self.output_path {
            append(path, &step_outputs(report, &json))?;
        }
        if let Some(path) = &self.summary_path {
            append(path, &step_summary(report, &json))?;
        }
        Ok(())
    }
}

fn append(path: &Path, text: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("failed to append to {}", path.display()))
}

fn step_outputs(report: &RunReport, json: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("policy_mode={}\n", report.policy_mode));
    out.push_str(&format!("regulatory_verdict={}\n", report.final_verdict));
    out.push_str(&format!("requires_approval={}\n", report.requires_approval));
    out.push_str(&format!("should_block={}\n", report.should_block));
    out.push_str(&format!("denial_reason={}\n", report.denial_reason));
    out.push_str(&format!("assessment_json<<{HEREDOC_MARKER}\n{json}\n{HEREDOC_MARKER}\n"));
    out
}

fn step_summary(report: &RunReport, json: &str) -> String {
    let denial = if report.denial_reason.is_empty() {
        "n/a"
    } else {
        report.denial_reason.as_str()
    };
    format!(
        "## Habitat Warden Result\n\n\
         - Policy mode: `{}`\n\
         - Final verdict: `{}`\n\
         - Requires approval: `{}`\n\
         - Should block: `{}`\n\
         - Denial reason: `{denial}`\n\n\
         <details><summary>Assessment JSON</summary>\n\n\
         ```json\n{json}\n```\n\
         </details>\n",
        report.policy_mode, report.final_verdict, report.requires_approval, report.should_block,
    )
}
