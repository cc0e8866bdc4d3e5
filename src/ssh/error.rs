// ABOUTME: SSH-specific error types.
// ABOUTME: Covers host key stores, key parsing, dialing, sessions, the agent and remote commands.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load known hosts from {path}: {reason}")]
    HostKeyStore { path: PathBuf, reason: String },

    #[error("unable to parse private key: {0}")]
    KeyParse(String),

    #[error("failed to dial {target}: {reason}")]
    Dial { target: String, reason: String },

    #[error("failed to open session: {0}")]
    Session(String),

    #[error("agent forwarding failed: {0}")]
    Agent(String),

    #[error("command execution failed: {0}")]
    CommandFailed(String),

    #[error("remote command exited with status {0}")]
    ExitStatus(u32),

    #[error("remote command killed by signal {0}")]
    Signal(String),

    #[error("channel closed unexpectedly without exit status")]
    ChannelClosed,

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad category of an [`Error`], independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    HostKeyStore,
    KeyParse,
    Dial,
    Session,
    Agent,
    Command,
    State,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::HostKeyStore { .. } => ErrorKind::HostKeyStore,
            Error::KeyParse(_) => ErrorKind::KeyParse,
            Error::Dial { .. } => ErrorKind::Dial,
            Error::Session(_) => ErrorKind::Session,
            Error::Agent(_) => ErrorKind::Agent,
            Error::CommandFailed(_)
            | Error::ExitStatus(_)
            | Error::Signal(_)
            | Error::ChannelClosed
            | Error::Io(_) => ErrorKind::Command,
            Error::NotConnected | Error::AlreadyConnected => ErrorKind::State,
        }
    }

    pub(crate) fn dial(target: &str, reason: impl Into<String>) -> Self {
        Error::Dial {
            target: target.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
