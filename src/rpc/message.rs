//! JSON-RPC 2.0 message shapes used on the agent's stdio pipes.
//!
//! Inbound JSON is classified exactly once, at the framing boundary, into a
//! closed [`Message`] variant. Nothing past the framer looks at raw
//! discriminant keys again.

use std::fmt;

use serde_json::{Map, Value, json};

/// Error code used when refusing a server-initiated request.
pub const SERVER_ERROR_CODE: i64 = -32000;

/// Request identifier as it appeared on the wire.
///
/// Our own requests always use integers. Server-initiated requests may use
/// either form, and replies must echo the exact type back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }

    /// Integer view used to correlate responses; numeric strings count.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            RequestId::Number(n) => Some(*n),
            RequestId::String(s) => s.trim().parse().ok(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => json!(n),
            RequestId::String(s) => json!(s),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

/// The error member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// One parsed line from the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Server-initiated request; must be answered.
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    /// Response to one of our requests.
    Response {
        id: RequestId,
        outcome: Result<Value, RpcErrorObject>,
    },
    /// Fire-and-forget event.
    Notification { method: String, params: Value },
}

impl Message {
    /// Classify a decoded JSON object, or explain why it is not a message.
    pub fn classify(value: Value) -> Result<Self, String> {
        let Value::Object(mut map) = value else {
            return Err("top-level JSON is not an object".to_string());
        };

        let id = match map.get("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                RequestId::from_value(raw).ok_or_else(|| format!("unsupported id value {raw}"))?,
            ),
        };

        if let Some(method) = map.remove("method") {
            let Value::String(method) = method else {
                return Err("method is not a string".to_string());
            };
            let params = map.remove("params").unwrap_or(Value::Null);
            return Ok(match id {
                Some(id) => Message::Request { id, method, params },
                None => Message::Notification { method, params },
            });
        }

        let Some(id) = id else {
            return Err("message has neither method nor id".to_string());
        };

        match (map.remove("result"), map.remove("error")) {
            (Some(result), None) => Ok(Message::Response {
                id,
                outcome: Ok(result),
            }),
            (None, Some(error)) => Ok(Message::Response {
                id,
                outcome: Err(parse_error_object(&error)),
            }),
            (Some(_), Some(_)) => Err(format!("response {id} carries both result and error")),
            (None, None) => Err(format!("response {id} carries neither result nor error")),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            Message::Response { .. } => None,
        }
    }

    /// One-line description for traffic logs. Never includes prompt text.
    pub fn summary(&self) -> String {
        match self {
            Message::Request { id, method, params } => {
                format!("request id={id} {}", method_summary(method, params))
            }
            Message::Notification { method, params } => {
                format!("notification {}", method_summary(method, params))
            }
            Message::Response { id, outcome: Ok(_) } => format!("response id={id}"),
            Message::Response {
                id,
                outcome: Err(err),
            } => format!("error response id={id} code={}", err.code),
        }
    }
}

fn parse_error_object(error: &Value) -> RpcErrorObject {
    RpcErrorObject {
        code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
    }
}

/// `method=<m>` plus a few safe hints from the params.
pub fn method_summary(method: &str, params: &Value) -> String {
    let mut out = format!("method={method}");
    let Some(map) = params.as_object() else {
        return out;
    };
    if let Some(thread_id) = map.get("threadId").and_then(Value::as_str) {
        out.push_str(&format!(" threadId={thread_id}"));
    }
    if let Some(policy) = map.get("approvalPolicy").and_then(Value::as_str) {
        out.push_str(&format!(" approvalPolicy={policy}"));
    }
    if map.contains_key("input") {
        out.push_str(" input=[redacted]");
    }
    if map.contains_key("outputSchema") {
        out.push_str(" outputSchema=<provided>");
    }
    out
}

/// Outbound request object.
pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

/// Outbound notification object; `params` is omitted when `None`.
pub fn notification(method: &str, params: Option<Value>) -> Value {
    let mut map = Map::new();
    map.insert("jsonrpc".to_string(), json!("2.0"));
    map.insert("method".to_string(), json!(method));
    if let Some(params) = params {
        map.insert("params".to_string(), params);
    }
    Value::Object(map)
}

/// Successful reply to a server-initiated request.
pub fn result_reply(id: &RequestId, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id.to_value(), "result": result})
}

/// Error reply to a server-initiated request.
pub fn error_reply(id: &RequestId, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.to_value(),
        "error": {"code": code, "message": message}
    })
}
