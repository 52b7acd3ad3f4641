//! One assessment conversation with the agent.
//!
//! ## Flow
//!
//! ```text
//! initialize → initialized → thread/start
//!   → turn/start(prompt) → wait for completion (timeout falls through)
//!   → thread/read → extract
//!       ├─ ok            → done
//!       └─ failed        → turn/start(repair) → wait → thread/read → extract
//!                              ├─ ok     → done (repair_turn_used)
//!                              └─ failed → RepairFailed
//! ```
//!
//! Only a turn-wait *timeout* falls through to `thread/read`; some agent
//! builds never emit a completion event, but the history read still carries
//! the answer. Transport death anywhere is fatal.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::assessment::Assessment;
use crate::error::{ExtractionError, WardenError};
use crate::extract;
use crate::prompt::REPAIR_PROMPT;
use crate::rpc::{AppServerClient, Transport};

const TERMINAL_TURN_STATUSES: [&str; 3] = ["completed", "failed", "interrupted"];

/// Everything the conversation needs besides the transport.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub client_name: String,
    pub client_version: String,
    /// Empty means the server picks.
    pub model: String,
    pub cwd: PathBuf,
    pub turn_timeout: Duration,
    pub prompt: String,
    pub output_schema: Value,
}

/// A successfully extracted assessment plus how we got it.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentOutcome {
    pub assessment: Assessment,
    pub thread_id: String,
    /// The first extraction failed and the repair turn produced the answer.
    pub repair_turn_used: bool,
    /// The answer was recovered through `thread/read` after a turn wait timed out.
    pub recovered_after_wait_timeout: bool,
}

struct TurnRun {
    turn_id: String,
    /// `result` of `turn/start`, kept as a last extraction source.
    start_result: Value,
    wait_timed_out: bool,
}

/// Drive a full assessment conversation over an initialized transport.
pub fn run_assessment<T: Transport>(
    client: &mut AppServerClient<T>,
    params: &SessionParams,
) -> Result<AssessmentOutcome, WardenError> {
    client.request(
        "initialize",
        json!({
            "clientInfo": {"name": params.client_name, "version": params.client_version},
            "capabilities": {"experimentalApi": true},
        }),
    )?;
    client.notify("initialized", Some(json!({})))?;

    let thread_id = start_thread(client, params)?;
    info!(%thread_id, "thread started");

    let first = run_turn(client, params, &thread_id, &params.prompt)?;
    let first_error = match read_and_extract(client, &thread_id, &first)? {
        Ok(assessment) => {
            if first.wait_timed_out {
                info!(turn_id = %first.turn_id, "recovered assessment via thread/read after turn wait timeout");
            }
            return Ok(AssessmentOutcome {
                assessment,
                thread_id,
                repair_turn_used: false,
                recovered_after_wait_timeout: first.wait_timed_out,
            });
        }
        Err(err) => err,
    };

    warn!(
        turn_id = %first.turn_id,
        error = %first_error,
        "structured parse failed; triggering one repair turn"
    );

    let repair = run_turn(client, params, &thread_id, REPAIR_PROMPT)?;
    match read_and_extract(client, &thread_id, &repair)? {
        Ok(assessment) => {
            if repair.wait_timed_out {
                info!(turn_id = %repair.turn_id, "recovered assessment via thread/read after repair turn wait timeout");
            }
            Ok(AssessmentOutcome {
                assessment,
                thread_id,
                repair_turn_used: true,
                recovered_after_wait_timeout: repair.wait_timed_out,
            })
        }
        Err(repair_error) => Err(WardenError::RepairFailed {
            first: first_error,
            repair: repair_error,
        }),
    }
}

fn start_thread<T: Transport>(
    client: &mut AppServerClient<T>,
    params: &SessionParams,
) -> Result<String, WardenError> {
    let mut thread_params = json!({
        "approvalPolicy": "never",
        "sandbox": "read-only",
        "cwd": params.cwd.to_string_lossy(),
        // thread/read only returns turn items (agentMessage included) with this set.
        "persistExtendedHistory": true,
    });
    if !params.model.is_empty() {
        thread_params["model"] = json!(params.model);
    }

    let result = client.request("thread/start", thread_params)?;
    result
        .pointer("/thread/id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| WardenError::Protocol("thread/start returned no thread id".to_string()))
}

fn run_turn<T: Transport>(
    client: &mut AppServerClient<T>,
    params: &SessionParams,
    thread_id: &str,
    input: &str,
) -> Result<TurnRun, WardenError> {
    let start_result = client.request(
        "turn/start",
        json!({
            "threadId": thread_id,
            "approvalPolicy": "never",
            "input": [{"type": "text", "text": input}],
            "outputSchema": params.output_schema,
        }),
    )?;

    let turn_id = start_result
        .pointer("/turn/id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| WardenError::Protocol("turn/start returned no turn id".to_string()))?;

    let status = start_result.pointer("/turn/status").and_then(Value::as_str);
    let mut wait_timed_out = false;
    if status.is_some_and(|s| TERMINAL_TURN_STATUSES.contains(&s)) {
        info!(%turn_id, status = status.unwrap_or_default(), "turn already terminal");
    } else {
        match client.wait_for_turn_completion(&turn_id, params.turn_timeout) {
            Ok(done) => {
                info!(%turn_id, status = done.status().unwrap_or("unknown"), "turn finished");
            }
            Err(err) if err.is_turn_timeout() => {
                warn!(%turn_id, error = %err, "turn completion wait failed; attempting thread/read fallback");
                wait_timed_out = true;
            }
            Err(err) => return Err(err),
        }
    }

    Ok(TurnRun {
        turn_id,
        start_result,
        wait_timed_out,
    })
}

/// Read the full thread and try to extract. The outer error is fatal; the
/// inner one is an extraction failure eligible for repair.
fn read_and_extract<T: Transport>(
    client: &mut AppServerClient<T>,
    thread_id: &str,
    turn: &TurnRun,
) -> Result<Result<Assessment, ExtractionError>, WardenError> {
    let result = client.request(
        "thread/read",
        json!({"threadId": thread_id, "includeTurns": true}),
    )?;

    match result.get("thread").filter(|t| t.is_object()) {
        Some(thread) => Ok(extract::parse_assessment_from_thread(thread)),
        None => {
            warn!(turn_id = %turn.turn_id, "thread/read returned no thread; extracting from turn/start response");
            Ok(extract::parse_assessment_from_payload(&turn.start_result))
        }
    }
}
