// ABOUTME: SSH client module: key-based connections with in-memory agent forwarding.
// ABOUTME: Supports insecure or known_hosts host key checking and streamed command execution.

pub mod agent;
mod client;
mod config;
mod error;
mod host_key;

pub use agent::ForwardingAgent;
pub use client::{CommandOutput, KeyForwarder};
pub use config::{AGENT_CONFIRM_BEFORE_USE, AGENT_KEY_LIFETIME, ForwarderConfig, Target};
pub use error::{Error, ErrorKind, Result};
pub use host_key::HostKeyPolicy;
