//! Error types for the forwarder.
//!
//! Every variant here is handled at the boundary that detects it: a bad frame drops one
//! control connection, a bind or listener failure affects one port. Only failing to bind
//! the control socket (reported through `anyhow` by the controller) stops the daemon.

use crate::forward::Command;
use std::io;

/// A control frame could not be read or parsed.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("short command frame ({read} of {expected} bytes)")]
    Truncated { read: usize, expected: usize },
    #[error("reading command frame: {0}")]
    Io(#[source] io::Error),
    #[error("invalid port field {0:?}")]
    InvalidPort(String),
    #[error("invalid command type field {0:?}")]
    InvalidType(String),
    #[error("missing ':' separator in command frame")]
    MissingSeparator,
    #[error("timed out waiting for command frame")]
    Timeout,
}

/// A listener stopped on its own (accept or relay failure).
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("accepting device connection: {0}")]
    Accept(#[source] io::Error),
    #[error("relaying between device and host: {0}")]
    Relay(#[source] io::Error),
}

/// Errors surfaced by controller operations and host-side helpers.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("binding device port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no listener for port {0}")]
    UnknownPort(u16),
    #[error("unexpected reply {0}")]
    UnexpectedReply(Command),
    #[error("control connection: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = ForwardError> = std::result::Result<T, E>;
