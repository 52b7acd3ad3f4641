//! Prompt text sent to the agent.
//!
//! The first turn carries the whole review context (policy patterns, changed
//! files, and the clipped diff). The repair turn reuses the thread context
//! and only restates the output contract.

use std::fmt::Write as _;

use crate::policy::PolicyConfig;

/// Instruction for the single retry after extraction fails.
pub const REPAIR_PROMPT: &str = "Return ONLY a single JSON object that strictly matches the provided output schema. \
Do not include markdown, prose, or code fences. \
Re-evaluate the existing thread context and output the final schema object only.";

const TRUNCATION_MARKER: &str = "[TRUNCATED_BY_WARDEN]";

/// Clip `diff` to `max_chars` characters, appending a truncation notice.
pub fn clip_diff(diff: &str, max_chars: usize) -> String {
    match diff.char_indices().nth(max_chars) {
        None => diff.to_string(),
        Some((cut, _)) => format!(
            "{}\n\n{TRUNCATION_MARKER}\nOriginal diff length exceeded {max_chars} characters.",
            &diff[..cut]
        ),
    }
}

/// Compose the first-turn review prompt.
pub fn build_prompt(diff: &str, changed_files: &[String], policy: &PolicyConfig) -> String {
    let mut out = String::with_capacity(diff.len() + 1024);
    out.push_str(
        "You are the Habitat Warden.\n\
         Return ONLY JSON that matches the provided schema exactly.\n\
         Do not include markdown, prose, or code fences.\n\
         Evaluate repository risk from this pull request diff.\n\n\
         Definitions:\n\
         - EXTINCTION_LEVEL: catastrophic security or reliability risk.\n\
         - critical_habitat_interference: true only when critical deploy/infra surface is materially changed.\n\
         - mitigation_plan_verified: true only when controls/tests/rollback are present in the change context.\n\n",
    );

    out.push_str("Critical habitat regex in policy:\n");
    let patterns: Vec<String> = policy.pattern_sources().map(|p| format!("- {p}")).collect();
    out.push_str(&patterns.join("\n"));
    out.push_str("\n\n");

    out.push_str("Changed files:\n");
    if changed_files.is_empty() {
        out.push_str("- [none]");
    } else {
        let lines: Vec<String> = changed_files.iter().map(|f| format!("- {f}")).collect();
        out.push_str(&lines.join("\n"));
    }
    out.push_str("\n\n");

    let _ = writeln!(out, "Git diff:\n{diff}");
    out
}
