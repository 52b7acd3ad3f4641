//! Stdio JSON-RPC plumbing for the agent's app-server mode.
//!
//! Layers, bottom to top:
//! - [`transport`]: the child process and its non-blocking pipes
//! - [`framer`]: newline-delimited JSON into classified [`message::Message`]s
//! - [`wait`]: deadline and progress bookkeeping for blocking waits
//! - [`client`]: request correlation, server-request refusal, turn completion

pub mod client;
pub mod framer;
pub mod message;
pub mod transport;
pub mod wait;

pub use client::{AppServerClient, RpcTimeouts, TurnCompletion};
pub use transport::{ChildTransport, Transport};
