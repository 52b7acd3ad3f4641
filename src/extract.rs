//! Recovering an [`Assessment`] from a conversation thread.
//!
//! Agent output arrives as an arbitrarily nested JSON tree whose shape drifts
//! between agent builds. The search runs in two phases over that tree:
//!
//! 1. **Structural**: any object carrying every required field (directly or
//!    under an `assessment` wrapper) is projected onto those fields and
//!    validated.
//! 2. **Textual**: text fragments are gathered from conventional text-bearing
//!    keys, and any fragment that looks like it holds a JSON object is parsed
//!    and validated.
//!
//! All traversal uses explicit stacks so deeply nested output cannot exhaust
//! the call stack. Object children are visited in the order the agent wrote
//! them (`serde_json` is built with `preserve_order`).

use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::debug;

use crate::assessment::{Assessment, REQUIRED_FIELDS, parse_assessment_text};
use crate::error::ExtractionError;

/// Wrapper key under which agents sometimes nest the assessment object.
const WRAPPER_KEY: &str = "assessment";

/// Text-bearing keys, most specific first.
const PREFERRED_TEXT_KEYS: [&str; 9] = [
    "text",
    "output_text",
    "value",
    "content",
    "message",
    "messages",
    "response",
    "output",
    "result",
];

/// Search a full thread, most recent turn first, then the thread as a whole.
pub fn parse_assessment_from_thread(thread: &Value) -> Result<Assessment, ExtractionError> {
    let mut errors = Vec::new();

    if let Some(turns) = thread.get("turns").and_then(Value::as_array) {
        for (index, turn) in turns.iter().enumerate().rev() {
            match parse_assessment_from_payload(turn) {
                Ok(found) => {
                    debug!(turn_index = index, "assessment recovered from turn");
                    return Ok(found);
                }
                Err(err) => errors.extend(err.errors),
            }
        }
    }

    match parse_assessment_from_payload(thread) {
        Ok(found) => Ok(found),
        Err(err) => {
            errors.extend(err.errors);
            Err(ExtractionError::new(errors))
        }
    }
}

/// Run both search phases over a single payload.
pub fn parse_assessment_from_payload(payload: &Value) -> Result<Assessment, ExtractionError> {
    let nodes = depth_first_nodes(payload);
    let mut errors = Vec::new();

    for node in &nodes {
        let Some(candidate) = structural_candidate(node) else {
            continue;
        };
        match Assessment::from_value(candidate) {
            Ok(found) => return Ok(found),
            Err(err) => errors.push(format!("dict candidate invalid: {err}")),
        }
    }

    let mut seen: HashSet<String> = HashSet::new();
    for node in &nodes {
        let text = match node {
            Value::String(s) => s.trim().to_string(),
            Value::Object(_) | Value::Array(_) => text_payload(node),
            _ => continue,
        };
        if text.is_empty() || !seen.insert(text.clone()) {
            continue;
        }
        if !text.contains('{') || !text.contains('}') {
            continue;
        }
        match parse_assessment_text(&text) {
            Ok(found) => return Ok(found),
            Err(err) => errors.push(format!("text candidate invalid: {err}")),
        }
    }

    Err(ExtractionError::new(errors))
}

/// Every node in the tree, parents before children, last child explored first.
fn depth_first_nodes(root: &Value) -> Vec<&Value> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(current) = stack.pop() {
        out.push(current);
        match current {
            Value::Object(map) => stack.extend(map.values()),
            Value::Array(items) => stack.extend(items.iter()),
            _ => {}
        }
    }
    out
}

fn has_required_fields(map: &Map<String, Value>) -> bool {
    REQUIRED_FIELDS.iter().all(|key| map.contains_key(*key))
}

/// Project an object (or its wrapped child) onto the required fields.
fn structural_candidate(node: &Value) -> Option<Value> {
    let map = node.as_object()?;
    let source = if has_required_fields(map) {
        map
    } else {
        match map.get(WRAPPER_KEY) {
            Some(Value::Object(inner)) if has_required_fields(inner) => inner,
            _ => return None,
        }
    };

    let projected: Map<String, Value> = REQUIRED_FIELDS
        .iter()
        .filter_map(|key| source.get(*key).map(|v| (key.to_string(), v.clone())))
        .collect();
    Some(Value::Object(projected))
}

enum Step<'a> {
    Visit(&'a Value),
    FoldArray(usize),
    FoldObject(&'a Map<String, Value>),
}

/// Join the text fragments reachable from `value` into one string.
pub fn text_payload(value: &Value) -> String {
    collect_text_fragments(value).join("\n").trim().to_string()
}

/// Gather trimmed, non-empty text fragments from `value`.
///
/// Objects contribute the fragments under their preferred text keys. Only if
/// those yield nothing do they fall through to the first child that does.
pub fn collect_text_fragments(value: &Value) -> Vec<String> {
    // Post-order evaluation: children push their fragment lists onto
    // `results`, and each container folds its children's lists once they are
    // all available.
    let mut steps = vec![Step::Visit(value)];
    let mut results: Vec<Vec<String>> = Vec::new();

    while let Some(step) = steps.pop() {
        match step {
            Step::Visit(Value::String(s)) => {
                let trimmed = s.trim();
                results.push(if trimmed.is_empty() {
                    Vec::new()
                } else {
                    vec![trimmed.to_string()]
                });
            }
            Step::Visit(Value::Array(items)) => {
                steps.push(Step::FoldArray(items.len()));
                steps.extend(items.iter().rev().map(Step::Visit));
            }
            Step::Visit(Value::Object(map)) => {
                steps.push(Step::FoldObject(map));
                let children: Vec<&Value> = map.values().collect();
                steps.extend(children.into_iter().rev().map(Step::Visit));
            }
            Step::Visit(_) => results.push(Vec::new()),
            Step::FoldArray(len) => {
                let children = results.split_off(results.len() - len);
                results.push(children.into_iter().flatten().collect());
            }
            Step::FoldObject(map) => {
                let children = results.split_off(results.len() - map.len());
                results.push(fold_object(map, children));
            }
        }
    }

    results.pop().unwrap_or_default()
}

fn fold_object(map: &Map<String, Value>, children: Vec<Vec<String>>) -> Vec<String> {
    let keys: Vec<&String> = map.keys().collect();

    let preferred: Vec<String> = PREFERRED_TEXT_KEYS
        .iter()
        .filter_map(|wanted| keys.iter().position(|k| k.as_str() == *wanted))
        .flat_map(|index| children[index].iter().cloned())
        .collect();
    if !preferred.is_empty() {
        return preferred;
    }

    children
        .into_iter()
        .find(|fragments| !fragments.is_empty())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessment::{InvasiveSeverity, RegulatoryVerdict};
    use serde_json::json;

    fn valid_object() -> Value {
        json!({
            "conservation_status_change": "DEGRADED",
            "critical_habitat_interference": true,
            "mitigation_plan_verified": false,
            "invasive_pattern_detection": [{
                "pattern_name": "unpinned-action",
                "severity": "HIGH",
                "remediation_suggestion": "Pin the action to a SHA."
            }],
            "regulatory_verdict": "REQUIRE_APPROVAL"
        })
    }

    #[test]
    fn finds_direct_structural_candidate() {
        let payload = json!({"items": [{"type": "agentMessage", "data": valid_object()}]});
        let found = parse_assessment_from_payload(&payload).unwrap();
        assert_eq!(found.regulatory_verdict, RegulatoryVerdict::RequireApproval);
        assert_eq!(
            found.invasive_pattern_detection[0].severity,
            InvasiveSeverity::High
        );
    }

    #[test]
    fn finds_candidate_under_wrapper_key() {
        let payload = json!({"result": {"assessment": valid_object(), "model": "x"}});
        assert!(parse_assessment_from_payload(&payload).is_ok());
    }

    #[test]
    fn sibling_keys_are_projected_away() {
        let mut object = valid_object();
        object["id"] = json!("item-7");
        object["type"] = json!("structured");
        let found = parse_assessment_from_payload(&json!([object])).unwrap();
        assert!(found.critical_habitat_interference);
    }

    #[test]
    fn invalid_structural_candidate_falls_through_to_text() {
        let mut broken = valid_object();
        broken["regulatory_verdict"] = json!("MAYBE");
        let text = serde_json::to_string(&valid_object()).unwrap();
        let payload = json!({
            "items": [
                {"type": "reasoning", "summary": broken},
                {"type": "agentMessage", "text": format!("```json\n{text}\n```")}
            ]
        });
        let found = parse_assessment_from_payload(&payload).unwrap();
        assert_eq!(found.regulatory_verdict, RegulatoryVerdict::RequireApproval);
    }

    #[test]
    fn text_inside_nested_content_is_found() {
        let text = serde_json::to_string(&valid_object()).unwrap();
        let payload = json!({
            "items": [{
                "type": "message",
                "content": [{"type": "output_text", "text": text}]
            }]
        });
        assert!(parse_assessment_from_payload(&payload).is_ok());
    }

    #[test]
    fn failure_collects_errors() {
        let payload = json!({
            "items": [
                {"type": "agentMessage", "text": "{\"regulatory_verdict\": \"APPROVE\"}"},
                {"type": "agentMessage", "text": "no json at all"}
            ]
        });
        let err = parse_assessment_from_payload(&payload).unwrap_err();
        assert!(!err.errors.is_empty());
        assert!(err.errors.iter().all(|e| e.starts_with("text candidate invalid")));
    }

    #[test]
    fn thread_search_prefers_most_recent_turn() {
        let mut older = valid_object();
        older["regulatory_verdict"] = json!("DENY");
        let mut newer = valid_object();
        newer["regulatory_verdict"] = json!("APPROVE");
        let thread = json!({
            "id": "thread-1",
            "turns": [
                {"id": "turn-1", "items": [{"type": "agentMessage", "data": older}]},
                {"id": "turn-2", "items": [{"type": "agentMessage", "data": newer}]}
            ]
        });
        let found = parse_assessment_from_thread(&thread).unwrap();
        assert_eq!(found.regulatory_verdict, RegulatoryVerdict::Approve);
    }

    #[test]
    fn thread_search_skips_turns_without_assessment() {
        let thread = json!({
            "turns": [
                {"id": "turn-1", "items": [{"type": "agentMessage", "data": valid_object()}]},
                {"id": "turn-2", "items": [{"type": "agentMessage", "text": "Sorry, I cannot."}]}
            ]
        });
        assert!(parse_assessment_from_thread(&thread).is_ok());
    }

    #[test]
    fn empty_thread_fails() {
        let err = parse_assessment_from_thread(&json!({"turns": []})).unwrap_err();
        assert!(err.to_string().contains("no valid structured assessment"));
    }

    #[test]
    fn preferred_keys_shadow_other_children() {
        let value = json!({
            "metadata": {"note": "ignored"},
            "text": "primary",
            "content": ["secondary"]
        });
        assert_eq!(collect_text_fragments(&value), vec!["primary", "secondary"]);
    }

    #[test]
    fn falls_back_to_first_child_with_text() {
        let value = json!({
            "a": {"n": 1},
            "b": {"deep": ["  first  ", "second"]},
            "c": "third"
        });
        assert_eq!(collect_text_fragments(&value), vec!["first", "second"]);
    }

    #[test]
    fn fallback_follows_document_order_not_key_order() {
        let value: Value =
            serde_json::from_str(r#"{"zeta": {"note": "written first"}, "alpha": "written second"}"#)
                .unwrap();
        assert_eq!(collect_text_fragments(&value), vec!["written first"]);
    }

    #[test]
    fn text_payload_joins_and_trims() {
        let value = json!(["  one ", "", {"text": "two"}, null, 5]);
        assert_eq!(text_payload(&value), "one\ntwo");
    }

    #[test]
    fn deep_nesting_does_not_overflow() {
        let mut value = json!({"text": "leaf"});
        for _ in 0..5_000 {
            value = json!({"content": [value]});
        }
        assert_eq!(collect_text_fragments(&value), vec!["leaf"]);
        assert!(parse_assessment_from_payload(&value).is_err());
        // serde_json drops nested values recursively; unwind it iteratively.
        let mut current = value;
        loop {
            match current {
                Value::Object(mut map) => match map.remove("content") {
                    Some(Value::Array(mut items)) if !items.is_empty() => {
                        current = items.remove(0);
                    }
                    _ => break,
                },
                _ => break,
            }
        }
    }
}
