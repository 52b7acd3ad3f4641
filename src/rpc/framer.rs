//! Newline-delimited JSON framing for the agent's stdout.

use serde_json::Value;
use tracing::debug;

use super::message::Message;

/// Accumulates raw stdout bytes and yields one [`Message`] per complete line.
///
/// A trailing partial line stays buffered until its newline arrives. Lines
/// that are not JSON, or JSON that is not a JSON-RPC message, are dropped.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes still waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Extract every complete line currently buffered, in arrival order.
    pub fn drain_messages(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        let mut consumed = 0;

        while let Some(offset) = self.buf[consumed..].iter().position(|b| *b == b'\n') {
            let line = &self.buf[consumed..consumed + offset];
            consumed += offset + 1;

            let text = String::from_utf8_lossy(line);
            let raw = text.trim();
            if raw.is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_str(raw) {
                Ok(v) => v,
                Err(_) => {
                    debug!(len = raw.len(), "ignoring non-JSON line from agent stdout");
                    continue;
                }
            };

            match Message::classify(value) {
                Ok(message) => {
                    debug!(message = %message.summary(), "RPC RECV");
                    messages.push(message);
                }
                Err(reason) => debug!(%reason, "dropping malformed JSON-RPC message"),
            }
        }

        self.buf.drain(..consumed);
        messages
    }
}
