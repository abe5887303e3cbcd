//! Port forwarding core: control protocol, per-port listeners, and the controller.
//!
//! The host sends one fixed-size command per control connection over a Unix socket:
//! `LISTEN` opens a device port, `DATA_CONNECTION` turns the connection itself into the
//! host side of a forwarding pair, and `UNLISTEN` closes a port and is answered with
//! `UNLISTEN_SUCCESS` or `UNLISTEN_ERROR`.

pub mod command;
mod controller;
mod listener;

pub use command::{Command, CommandType};
pub use controller::{run_forwarder, Controller, ControllerHandle};
pub use listener::{ExitNotifier, ExitReason, Listener, ListenerExit};
