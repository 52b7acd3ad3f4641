//! Deterministic policy engine over a model assessment.
//!
//! The model's own verdict is only the last word when neither override rule
//! fires. Evaluation order, first match wins:
//!
//! 1. an `EXTINCTION_LEVEL` pattern with `deny_on_extinction_level` → DENY
//! 2. a critical-habitat path changed, interference flagged, mitigation not
//!    verified, with `require_approval_on_unmitigated_critical_change` → REQUIRE_APPROVAL
//! 3. otherwise the model verdict passes through
//!
//! Advisory mode never blocks.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::assessment::{Assessment, RegulatoryVerdict};

/// Whether a blocking verdict actually fails the run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Report only.
    #[default]
    Advisory,
    /// DENY and REQUIRE_APPROVAL block.
    Enforce,
}

impl EnforcementMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EnforcementMode::Advisory => "advisory",
            EnforcementMode::Enforce => "enforce",
        }
    }
}

impl fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnforcementMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "advisory" => Ok(EnforcementMode::Advisory),
            "enforce" => Ok(EnforcementMode::Enforce),
            other => Err(format!("unknown enforcement mode '{other}'")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EnforcementSwitches {
    #[serde(default = "default_true")]
    deny_on_extinction_level: bool,
    #[serde(default = "default_true")]
    require_approval_on_unmitigated_critical_change: bool,
}

impl Default for EnforcementSwitches {
    fn default() -> Self {
        Self {
            deny_on_extinction_level: true,
            require_approval_on_unmitigated_critical_change: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// On-disk shape of the policy file.
#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    critical_habitat_regex: Vec<String>,
    #[serde(default)]
    enforcement: EnforcementSwitches,
}

/// Loaded, immutable policy with its path patterns compiled.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub mode: EnforcementMode,
    pub critical_habitat_regex: Vec<Regex>,
    pub deny_on_extinction_level: bool,
    pub require_approval_on_unmitigated_critical_change: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: EnforcementMode::default(),
            critical_habitat_regex: Vec::new(),
            deny_on_extinction_level: true,
            require_approval_on_unmitigated_critical_change: true,
        }
    }
}

impl PolicyConfig {
    /// Load a policy JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy {}", path.display()))?;
        Self::from_json(&contents).with_context(|| format!("invalid policy {}", path.display()))
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let raw: PolicyFile = serde_json::from_str(contents).context("failed to parse policy JSON")?;

        let mode = match raw.mode.as_deref() {
            None => EnforcementMode::default(),
            Some(text) => text.parse().unwrap_or_else(|err: String| {
                warn!(%err, "falling back to advisory mode");
                EnforcementMode::Advisory
            }),
        };

        let critical_habitat_regex = raw
            .critical_habitat_regex
            .iter()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("invalid critical_habitat_regex pattern '{pattern}'"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            mode,
            critical_habitat_regex,
            deny_on_extinction_level: raw.enforcement.deny_on_extinction_level,
            require_approval_on_unmitigated_critical_change: raw
                .enforcement
                .require_approval_on_unmitigated_critical_change,
        })
    }

    /// Source text of each compiled pattern, in file order.
    pub fn pattern_sources(&self) -> impl Iterator<Item = &str> {
        self.critical_habitat_regex.iter().map(Regex::as_str)
    }
}

/// Read a changed-files list: one path per line, blanks skipped.
pub fn read_changed_files(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read changed files {}", path.display()))?;
    Ok(parse_changed_files(&contents))
}

pub fn parse_changed_files(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether any changed path matches any critical-habitat pattern.
pub fn critical_habitat_touched(changed_files: &[String], patterns: &[Regex]) -> bool {
    changed_files
        .iter()
        .any(|file| patterns.iter().any(|re| re.is_match(file)))
}

/// Final word on a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyDecision {
    pub final_verdict: RegulatoryVerdict,
    pub requires_approval: bool,
    pub should_block: bool,
    pub denial_reason: String,
    pub reasons: Vec<String>,
    pub critical_habitat_touched: bool,
}

pub fn apply_policy(
    assessment: &Assessment,
    changed_files: &[String],
    policy: &PolicyConfig,
) -> PolicyDecision {
    let mut reasons = Vec::new();
    let touched = critical_habitat_touched(changed_files, &policy.critical_habitat_regex);

    let verdict = if policy.deny_on_extinction_level && assessment.has_extinction_level_pattern() {
        reasons.push("Detected EXTINCTION_LEVEL invasive pattern.".to_string());
        RegulatoryVerdict::Deny
    } else if policy.require_approval_on_unmitigated_critical_change
        && touched
        && assessment.critical_habitat_interference
        && !assessment.mitigation_plan_verified
    {
        reasons.push("Critical habitat change is unmitigated.".to_string());
        RegulatoryVerdict::RequireApproval
    } else {
        let verdict = assessment.regulatory_verdict;
        reasons.push(format!("Using model verdict: {verdict}."));
        verdict
    };

    let requires_approval = verdict == RegulatoryVerdict::RequireApproval;
    let denial_reason = if verdict == RegulatoryVerdict::Deny {
        reasons.join(" ")
    } else {
        String::new()
    };
    let should_block = policy.mode == EnforcementMode::Enforce
        && matches!(
            verdict,
            RegulatoryVerdict::Deny | RegulatoryVerdict::RequireApproval
        );

    PolicyDecision {
        final_verdict: verdict,
        requires_approval,
        should_block,
        denial_reason,
        reasons,
        critical_habitat_touched: touched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessment::{ConservationStatus, InvasivePattern, InvasiveSeverity};
    use proptest::prelude::*;

    fn policy(mode: EnforcementMode) -> PolicyConfig {
        PolicyConfig {
            mode,
            critical_habitat_regex: vec![
                Regex::new(r"^\.github/workflows/").unwrap(),
                Regex::new(r"^stackcp/").unwrap(),
                Regex::new(r"^deploy\.sh$").unwrap(),
            ],
            ..PolicyConfig::default()
        }
    }

    fn assessment(
        interference: bool,
        mitigated: bool,
        severities: &[InvasiveSeverity],
        verdict: RegulatoryVerdict,
    ) -> Assessment {
        Assessment {
            conservation_status_change: ConservationStatus::Neutral,
            critical_habitat_interference: interference,
            mitigation_plan_verified: mitigated,
            invasive_pattern_detection: severities
                .iter()
                .enumerate()
                .map(|(i, severity)| InvasivePattern {
                    pattern_name: format!("pattern-{i}"),
                    severity: *severity,
                    remediation_suggestion: "fix it".to_string(),
                })
                .collect(),
            regulatory_verdict: verdict,
        }
    }

    fn files(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn extinction_level_forces_deny() {
        let a = assessment(
            false,
            true,
            &[InvasiveSeverity::ExtinctionLevel],
            RegulatoryVerdict::Approve,
        );
        let decision = apply_policy(&a, &files(&["src/app.ts"]), &policy(EnforcementMode::Enforce));
        assert_eq!(decision.final_verdict, RegulatoryVerdict::Deny);
        assert!(decision.should_block);
        assert!(!decision.requires_approval);
        assert_eq!(decision.denial_reason, "Detected EXTINCTION_LEVEL invasive pattern.");
    }

    #[test]
    fn extinction_switch_off_keeps_model_verdict() {
        let a = assessment(
            false,
            true,
            &[InvasiveSeverity::ExtinctionLevel],
            RegulatoryVerdict::Approve,
        );
        let mut p = policy(EnforcementMode::Enforce);
        p.deny_on_extinction_level = false;
        let decision = apply_policy(&a, &[], &p);
        assert_eq!(decision.final_verdict, RegulatoryVerdict::Approve);
        assert_eq!(decision.reasons, vec!["Using model verdict: APPROVE."]);
    }

    #[test]
    fn unmitigated_critical_change_requires_approval() {
        let a = assessment(true, false, &[], RegulatoryVerdict::Approve);
        let decision = apply_policy(
            &a,
            &files(&[".github/workflows/deploy.yml"]),
            &policy(EnforcementMode::Enforce),
        );
        assert_eq!(decision.final_verdict, RegulatoryVerdict::RequireApproval);
        assert!(decision.requires_approval);
        assert!(decision.should_block);
        assert!(decision.critical_habitat_touched);
        assert!(decision.denial_reason.is_empty());
        assert_eq!(decision.reasons, vec!["Critical habitat change is unmitigated."]);
    }

    #[test]
    fn mitigated_critical_change_keeps_model_verdict() {
        let a = assessment(true, true, &[], RegulatoryVerdict::Approve);
        let decision = apply_policy(&a, &files(&["deploy.sh"]), &policy(EnforcementMode::Enforce));
        assert_eq!(decision.final_verdict, RegulatoryVerdict::Approve);
        assert!(decision.critical_habitat_touched);
        assert!(!decision.should_block);
    }

    #[test]
    fn noncritical_change_keeps_model_verdict() {
        let a = assessment(true, false, &[], RegulatoryVerdict::Approve);
        let decision = apply_policy(
            &a,
            &files(&["src/pages/index.astro"]),
            &policy(EnforcementMode::Advisory),
        );
        assert_eq!(decision.final_verdict, RegulatoryVerdict::Approve);
        assert!(!decision.should_block);
        assert!(!decision.critical_habitat_touched);
    }

    #[test]
    fn patterns_are_unanchored_searches() {
        let patterns = vec![Regex::new("infra/").unwrap()];
        assert!(critical_habitat_touched(&files(&["ops/infra/main.tf"]), &patterns));
        assert!(!critical_habitat_touched(&files(&["docs/readme.md"]), &patterns));
        assert!(!critical_habitat_touched(&[], &patterns));
    }

    #[test]
    fn advisory_never_blocks() {
        let a = assessment(false, false, &[InvasiveSeverity::ExtinctionLevel], RegulatoryVerdict::Deny);
        let decision = apply_policy(&a, &[], &policy(EnforcementMode::Advisory));
        assert_eq!(decision.final_verdict, RegulatoryVerdict::Deny);
        assert!(!decision.should_block);
    }

    #[test]
    fn load_policy_file_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("policy.json");
        std::fs::write(&path, r#"{"critical_habitat_regex": ["^infra/"]}"#).unwrap();
        let p = PolicyConfig::load(&path).unwrap();
        assert_eq!(p.mode, EnforcementMode::Advisory);
        assert!(p.deny_on_extinction_level);
        assert!(p.require_approval_on_unmitigated_critical_change);
        assert_eq!(p.pattern_sources().collect::<Vec<_>>(), vec!["^infra/"]);
    }

    #[test]
    fn load_policy_full() {
        let p = PolicyConfig::from_json(
            r#"{
                "mode": "ENFORCE",
                "critical_habitat_regex": ["^a/", "^b/"],
                "enforcement": {
                    "deny_on_extinction_level": false,
                    "require_approval_on_unmitigated_critical_change": true
                }
            }"#,
        )
        .unwrap();
        assert_eq!(p.mode, EnforcementMode::Enforce);
        assert_eq!(p.critical_habitat_regex.len(), 2);
        assert!(!p.deny_on_extinction_level);
    }

    #[test]
    fn unknown_mode_falls_back_to_advisory() {
        let p = PolicyConfig::from_json(r#"{"mode": "strict"}"#).unwrap();
        assert_eq!(p.mode, EnforcementMode::Advisory);
    }

    #[test]
    fn invalid_regex_is_a_load_error() {
        let err = PolicyConfig::from_json(r#"{"critical_habitat_regex": ["(unclosed"]}"#).unwrap_err();
        assert!(format!("{err:#}").contains("(unclosed"));
    }

    #[test]
    fn changed_files_are_trimmed_and_blanks_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("changed.txt");
        std::fs::write(&path, "  src/a.rs \n\n\t\ndeploy.sh\r\n").unwrap();
        assert_eq!(read_changed_files(&path).unwrap(), vec!["src/a.rs", "deploy.sh"]);
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("Enforce".parse::<EnforcementMode>(), Ok(EnforcementMode::Enforce));
        assert_eq!(" advisory ".parse::<EnforcementMode>(), Ok(EnforcementMode::Advisory));
        assert!("block".parse::<EnforcementMode>().is_err());
        assert_eq!(EnforcementMode::Enforce.to_string(), "enforce");
    }

    fn severity() -> impl Strategy<Value = InvasiveSeverity> {
        prop_oneof![
            Just(InvasiveSeverity::Low),
            Just(InvasiveSeverity::Medium),
            Just(InvasiveSeverity::High),
            Just(InvasiveSeverity::ExtinctionLevel),
        ]
    }

    fn verdict() -> impl Strategy<Value = RegulatoryVerdict> {
        prop_oneof![
            Just(RegulatoryVerdict::Approve),
            Just(RegulatoryVerdict::Deny),
            Just(RegulatoryVerdict::RequireApproval),
        ]
    }

    proptest! {
        #[test]
        fn policy_is_idempotent(
            interference in any::<bool>(),
            mitigated in any::<bool>(),
            severities in proptest::collection::vec(severity(), 0..4),
            model_verdict in verdict(),
            enforce in any::<bool>(),
            paths in proptest::collection::vec("[a-z./]{1,20}", 0..5),
        ) {
            let a = assessment(interference, mitigated, &severities, model_verdict);
            let mode = if enforce { EnforcementMode::Enforce } else { EnforcementMode::Advisory };
            let p = policy(mode);
            let first = apply_policy(&a, &paths, &p);
            let second = apply_policy(&a, &paths, &p);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(
                first.requires_approval,
                first.final_verdict == RegulatoryVerdict::RequireApproval
            );
            if !enforce {
                prop_assert!(!first.should_block);
            }
        }

        #[test]
        fn extinction_level_always_denies(
            model_verdict in verdict(),
            interference in any::<bool>(),
        ) {
            let a = assessment(
                interference,
                false,
                &[InvasiveSeverity::Low, InvasiveSeverity::ExtinctionLevel],
                model_verdict,
            );
            let decision = apply_policy(&a, &files(&["deploy.sh"]), &policy(EnforcementMode::Enforce));
            prop_assert_eq!(decision.final_verdict, RegulatoryVerdict::Deny);
            prop_assert!(decision.should_block);
        }
    }
}
