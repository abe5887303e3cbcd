//! Device forwarder core library: control protocol, port listeners, and the controller
//! daemon, plus host-side helpers used by the CLI.

pub mod config;
pub mod error;
pub mod forward;
pub mod host;
pub mod init;
pub mod shutdown;
