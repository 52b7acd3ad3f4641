//! The structured habitat impact assessment the agent must produce.
//!
//! Validation is strict: unknown fields are rejected, every field is required,
//! and enums only accept their exact upper-case wire names.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field names an object must carry to be considered an assessment candidate.
pub const REQUIRED_FIELDS: [&str; 5] = [
    "conservation_status_change",
    "critical_habitat_interference",
    "mitigation_plan_verified",
    "invasive_pattern_detection",
    "regulatory_verdict",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConservationStatus {
    Improved,
    Degraded,
    Neutral,
}

/// Severity tiers, lowest first. `ExtinctionLevel` is the highest tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvasiveSeverity {
    Low,
    Medium,
    High,
    ExtinctionLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegulatoryVerdict {
    Approve,
    Deny,
    RequireApproval,
}

impl RegulatoryVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            RegulatoryVerdict::Approve => "APPROVE",
            RegulatoryVerdict::Deny => "DENY",
            RegulatoryVerdict::RequireApproval => "REQUIRE_APPROVAL",
        }
    }
}

impl fmt::Display for RegulatoryVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InvasivePattern {
    pub pattern_name: String,
    pub severity: InvasiveSeverity,
    pub remediation_suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Assessment {
    pub conservation_status_change: ConservationStatus,
    pub critical_habitat_interference: bool,
    pub mitigation_plan_verified: bool,
    pub invasive_pattern_detection: Vec<InvasivePattern>,
    pub regulatory_verdict: RegulatoryVerdict,
}

impl Assessment {
    /// The conservative stand-in used whenever the agent pipeline fails.
    pub fn fail_safe() -> Self {
        Self {
            conservation_status_change: ConservationStatus::Neutral,
            critical_habitat_interference: false,
            mitigation_plan_verified: false,
            invasive_pattern_detection: Vec::new(),
            regulatory_verdict: RegulatoryVerdict::RequireApproval,
        }
    }

    /// Validate an arbitrary JSON value against the schema.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn has_extinction_level_pattern(&self) -> bool {
        self.invasive_pattern_detection
            .iter()
            .any(|p| p.severity == InvasiveSeverity::ExtinctionLevel)
    }
}

/// Why a piece of text could not be turned into an assessment.
#[derive(Debug, thiserror::Error)]
pub enum TextParseError {
    #[error("no JSON object found in assistant response")]
    NoObject,
    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("schema validation failed: {0}")]
    Schema(#[source] serde_json::Error),
}

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```(?:json)?\s*(.*?)```").expect("fenced block pattern is valid")
});

/// Isolate the JSON object inside free-form assistant text.
///
/// The first fenced code block wins if there is one. Otherwise the span from
/// the first `{` to the last `}` is taken.
pub fn extract_json_payload(raw: &str) -> Result<&str, TextParseError> {
    let mut text = raw.trim();

    if let Some(inner) = FENCED_BLOCK.captures(text).and_then(|c| c.get(1)) {
        text = inner.as_str().trim();
    }

    if text.starts_with('{') && text.ends_with('}') {
        return Ok(text);
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => Ok(&text[start..=end]),
        _ => Err(TextParseError::NoObject),
    }
}

/// Parse and validate an assessment out of assistant text.
pub fn parse_assessment_text(raw: &str) -> Result<Assessment, TextParseError> {
    let payload = extract_json_payload(raw)?;
    let value: Value = serde_json::from_str(payload).map_err(TextParseError::Json)?;
    Assessment::from_value(value).map_err(TextParseError::Schema)
}
