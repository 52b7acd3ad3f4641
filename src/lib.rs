//! Habitat Warden: drive a coding agent's app-server over stdio JSON-RPC,
//! recover a structured habitat impact assessment from the conversation,
//! and apply a deterministic enforcement policy to it.

#[cfg(not(unix))]
compile_error!("habitat-warden drives the agent through unix pipes and signals");

pub mod agent;
pub mod assessment;
pub mod config;
pub mod error;
pub mod extract;
pub mod policy;
pub mod prompt;
pub mod report;
pub mod rpc;
pub mod session;
pub mod warden;
