//! JSON-RPC client for the agent's app-server protocol.
//!
//! One thread owns everything here: the transport, the line framer, the queue
//! of parsed-but-unconsumed messages and the pending-response table. Both
//! blocking waits ([`AppServerClient::request`] and
//! [`AppServerClient::wait_for_turn_completion`]) pull from the same queue and
//! route anything they do not consume through [`AppServerClient::dispatch`], so
//! neither wait starves the other. Notifications that arrive while a request
//! is outstanding are held back for the next turn wait, so a turn that
//! finishes before `turn/start` is answered is still seen.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, info, trace, warn};

use super::framer::LineFramer;
use super::message::{self, Message, RequestId, RpcErrorObject, SERVER_ERROR_CODE};
use super::transport::Transport;
use super::wait::{IdleWait, WaitState};
use crate::error::WardenError;

/// Text returned to the agent when it asks us to run a dynamic tool.
const TOOL_CALL_REFUSAL: &str = "Dynamic tool calls are disabled in warden execution mode.";

/// Notifications kept from request waits; the oldest are dropped beyond this.
const DEFERRED_LIMIT: usize = 256;

/// The two timeout tiers plus polling cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcTimeouts {
    /// Deadline for a single request/response round trip.
    pub request: Duration,
    /// Longest single poll before re-checking deadlines.
    pub idle: Duration,
    /// How often a waiting loop logs that it is still waiting.
    pub progress_every: Duration,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            request: Duration::from_secs(60),
            idle: Duration::from_secs(5),
            progress_every: Duration::from_secs(15),
        }
    }
}

/// Which signal ended a turn wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSignal {
    /// An explicit `turn/completed` notification.
    TurnCompleted,
    /// An `item/completed` carrying the final `agentMessage`.
    AgentMessage,
}

/// Terminal state of a turn as reported by the completion signal.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnCompletion {
    pub turn: Value,
    pub signal: CompletionSignal,
}

impl TurnCompletion {
    pub fn status(&self) -> Option<&str> {
        self.turn.get("status").and_then(Value::as_str)
    }
}

/// How we answer a server-initiated request. We never perform the action.
#[derive(Debug, Clone, PartialEq)]
pub enum ConservativeReply {
    Result(Value),
    Error { code: i64, message: String },
}

/// The fixed refusal table for server-initiated requests.
pub fn conservative_reply(method: &str) -> ConservativeReply {
    match method {
        "item/commandExecution/requestApproval" | "item/fileChange/requestApproval" => {
            ConservativeReply::Result(json!({"decision": "cancel"}))
        }
        "item/tool/requestUserInput" => ConservativeReply::Result(json!({"answers": {}})),
        "item/tool/call" => ConservativeReply::Result(json!({
            "success": false,
            "contentItems": [{"type": "inputText", "text": TOOL_CALL_REFUSAL}],
        })),
        "execCommandApproval" | "applyPatchApproval" => {
            ConservativeReply::Result(json!({"decision": "abort"}))
        }
        other => ConservativeReply::Error {
            code: SERVER_ERROR_CODE,
            message: format!("Unsupported server request method: {other}"),
        },
    }
}

/// Match a notification against the completion shapes for `turn_id`.
pub fn completion_signal(method: &str, params: &Value, turn_id: &str) -> Option<TurnCompletion> {
    match method {
        "turn/completed" => {
            let turn = params.get("turn")?;
            (turn.get("id").and_then(Value::as_str) == Some(turn_id)).then(|| TurnCompletion {
                turn: turn.clone(),
                signal: CompletionSignal::TurnCompleted,
            })
        }
        // Some agent builds never emit turn/completed; the final agent message
        // completing is an equivalent signal.
        "item/completed" => {
            if params.get("turnId").and_then(Value::as_str) != Some(turn_id) {
                return None;
            }
            let item_type = params
                .get("item")
                .and_then(|item| item.get("type"))
                .and_then(Value::as_str);
            (item_type == Some("agentMessage")).then(|| TurnCompletion {
                turn: json!({"id": turn_id, "status": "completed"}),
                signal: CompletionSignal::AgentMessage,
            })
        }
        _ => None,
    }
}

/// Client session over one agent process.
pub struct AppServerClient<T: Transport> {
    transport: T,
    framer: LineFramer,
    inbox: VecDeque<Message>,
    deferred: VecDeque<(String, Value)>,
    outstanding: HashSet<i64>,
    pending: HashMap<i64, Result<Value, RpcErrorObject>>,
    next_id: u64,
    timeouts: RpcTimeouts,
}

impl<T: Transport> AppServerClient<T> {
    pub fn new(transport: T, timeouts: RpcTimeouts) -> Self {
        Self {
            transport,
            framer: LineFramer::new(),
            inbox: VecDeque::new(),
            deferred: VecDeque::new(),
            outstanding: HashSet::new(),
            pending: HashMap::new(),
            next_id: 1,
            timeouts,
        }
    }

    pub fn timeouts(&self) -> RpcTimeouts {
        self.timeouts
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give back the transport (and with it, ownership of the process).
    pub fn into_transport(self) -> T {
        self.transport
    }

    fn send(&mut self, payload: &Value) -> Result<(), WardenError> {
        if tracing::enabled!(tracing::Level::DEBUG) {
            let summary = match payload.get("method").and_then(Value::as_str) {
                Some(method) => message::method_summary(
                    method,
                    payload.get("params").unwrap_or(&Value::Null),
                ),
                None => format!("reply id={}", payload.get("id").unwrap_or(&Value::Null)),
            };
            debug!(%summary, "RPC SEND");
        }
        let line = payload.to_string();
        self.transport.write_line(&line).map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                self.transport_failure()
            } else {
                WardenError::Io(e)
            }
        })
    }

    fn transport_failure(&mut self) -> WardenError {
        let status = self
            .transport
            .exit_status()
            .unwrap_or_else(|| "stdin closed".to_string());
        WardenError::TransportFailure {
            status,
            stderr: self.transport.stderr_tail(),
        }
    }

    /// Send a notification (no reply expected).
    pub fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), WardenError> {
        self.send(&message::notification(method, params))
    }

    fn fill_inbox(&mut self) -> Result<(), WardenError> {
        let mut bytes = Vec::new();
        self.transport.read_available(&mut bytes)?;
        if !bytes.is_empty() {
            self.framer.push(&bytes);
            self.inbox.extend(self.framer.drain_messages());
        }
        Ok(())
    }

    /// Next inbound message, waiting at most `timeout`.
    ///
    /// `Ok(None)` means the wait idled out. Messages already sent by an agent
    /// that has since exited are still delivered before its death is reported.
    pub fn read_message(&mut self, timeout: Duration) -> Result<Option<Message>, WardenError> {
        let mut wait = IdleWait::new(timeout, timeout, Duration::MAX);
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Ok(Some(message));
            }

            if self.transport.exit_status().is_some() {
                self.fill_inbox()?;
                if let Some(message) = self.inbox.pop_front() {
                    return Ok(Some(message));
                }
                return Err(self.transport_failure());
            }

            let poll = match wait.state() {
                WaitState::Expired => return Ok(None),
                WaitState::Waiting(poll) => poll,
            };
            if self.transport.wait_readable(poll)? {
                self.fill_inbox()?;
            }
        }
    }

    /// Route one message that no waiter consumed.
    pub fn dispatch(&mut self, message: Message) -> Result<(), WardenError> {
        match message {
            Message::Request { id, method, params } => {
                self.handle_server_request(&id, &method, &params)
            }
            Message::Response { id, outcome } => {
                match id.as_number().filter(|n| self.outstanding.contains(n)) {
                    Some(n) => {
                        if self.pending.contains_key(&n) {
                            warn!(id = n, "duplicate response ignored");
                        } else {
                            self.pending.insert(n, outcome);
                        }
                    }
                    None => debug!(%id, "dropping response for unknown request id"),
                }
                Ok(())
            }
            Message::Notification { method, .. } => {
                trace!(%method, "notification ignored");
                Ok(())
            }
        }
    }

    fn handle_server_request(
        &mut self,
        id: &RequestId,
        method: &str,
        _params: &Value,
    ) -> Result<(), WardenError> {
        warn!(%method, "agent requested client action; responding conservatively");
        let reply = match conservative_reply(method) {
            ConservativeReply::Result(result) => message::result_reply(id, result),
            ConservativeReply::Error { code, message } => message::error_reply(id, code, &message),
        };
        self.send(&reply)
    }

    /// Route a message seen while a request is outstanding.
    fn route_during_request(&mut self, message: Message) -> Result<(), WardenError> {
        match message {
            Message::Notification { method, params } => {
                trace!(%method, "notification deferred");
                if self.deferred.len() == DEFERRED_LIMIT {
                    self.deferred.pop_front();
                }
                self.deferred.push_back((method, params));
                Ok(())
            }
            other => self.dispatch(other),
        }
    }

    /// Route everything already received without waiting.
    fn drain_ready(&mut self) -> Result<(), WardenError> {
        self.fill_inbox()?;
        while let Some(message) = self.inbox.pop_front() {
            self.route_during_request(message)?;
        }
        Ok(())
    }

    /// Send a request and block until its response arrives or the per-request
    /// deadline passes. Returns the response's `result` member.
    pub fn request(&mut self, method: &str, params: Value) -> Result<Value, WardenError> {
        let id = self.next_id;
        self.next_id += 1;
        let key = id as i64;

        self.outstanding.insert(key);
        let outcome = self.await_response(id, method, params);
        self.outstanding.remove(&key);
        self.pending.remove(&key);

        match outcome? {
            Ok(result) => Ok(result),
            Err(err) => Err(WardenError::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            }),
        }
    }

    fn await_response(
        &mut self,
        id: u64,
        method: &str,
        params: Value,
    ) -> Result<Result<Value, RpcErrorObject>, WardenError> {
        let key = id as i64;
        self.send(&message::request(id, method, params))?;

        let mut wait = IdleWait::new(
            self.timeouts.request,
            self.timeouts.idle,
            self.timeouts.progress_every,
        );
        loop {
            if let Some(outcome) = self.pending.remove(&key) {
                return Ok(outcome);
            }
            let poll = match wait.state() {
                WaitState::Waiting(poll) => poll,
                WaitState::Expired => {
                    self.drain_ready()?;
                    if let Some(outcome) = self.pending.remove(&key) {
                        return Ok(outcome);
                    }
                    return Err(WardenError::RpcTimeout {
                        method: method.to_string(),
                        after: self.timeouts.request,
                        stderr: self.transport.stderr_tail(),
                    });
                }
            };
            match self.read_message(poll)? {
                Some(message) => self.route_during_request(message)?,
                None => {
                    if let Some(remaining) = wait.progress_due() {
                        info!(
                            %method,
                            remaining_secs = remaining.as_secs(),
                            "waiting for response"
                        );
                    }
                }
            }
        }
    }

    /// Wait for `turn_id` to finish, answering and correlating everything else
    /// that arrives meanwhile.
    pub fn wait_for_turn_completion(
        &mut self,
        turn_id: &str,
        timeout: Duration,
    ) -> Result<TurnCompletion, WardenError> {
        while let Some((method, params)) = self.deferred.pop_front() {
            if let Some(done) = completion_signal(&method, &params, turn_id) {
                info!(%turn_id, %method, "turn finished before turn/start returned");
                self.deferred.clear();
                return Ok(done);
            }
        }

        let mut wait = IdleWait::new(timeout, self.timeouts.idle, self.timeouts.progress_every);
        loop {
            let poll = match wait.state() {
                WaitState::Waiting(poll) => poll,
                WaitState::Expired => {
                    return Err(WardenError::TurnTimeout {
                        turn_id: turn_id.to_string(),
                        after: timeout,
                        stderr: self.transport.stderr_tail(),
                    });
                }
            };

            let Some(incoming) = self.read_message(poll)? else {
                if let Some(remaining) = wait.progress_due() {
                    info!(
                        %turn_id,
                        remaining_secs = remaining.as_secs(),
                        "waiting for turn completion"
                    );
                }
                continue;
            };

            let done = match &incoming {
                Message::Notification { method, params } => {
                    completion_signal(method, params, turn_id)
                }
                _ => None,
            };
            if let Some(done) = done {
                match done.signal {
                    CompletionSignal::TurnCompleted => {
                        info!(%turn_id, "received turn/completed")
                    }
                    CompletionSignal::AgentMessage => {
                        info!(%turn_id, "detected agentMessage completion")
                    }
                }
                return Ok(done);
            }

            self.dispatch(incoming)?;
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn deferred_len(&self) -> usize {
        self.deferred.len()
    }
}
