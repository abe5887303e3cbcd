//! Host-side helpers that speak the control protocol to a running forwarder.
//!
//! Each call opens its own control connection, as the daemon reads exactly one command per
//! connection.

use crate::error::{ForwardError, ProtocolError, Result};
use crate::forward::command::{self, Command, CommandType, FRAME_LEN};
use std::path::Path;
use tokio::net::UnixStream;

/// Send one command and wait for the daemon to finish with the connection.
/// Returns the reply frame, or `None` when the daemon closed without replying.
pub async fn send_command(socket_path: &Path, kind: CommandType, port: u16) -> Result<Option<Command>> {
    let mut conn = UnixStream::connect(socket_path).await?;
    command::write_command(&mut conn, kind, port).await?;
    Ok(command::try_read_command(&mut conn).await?)
}

/// Ask the daemon to forward `port` (0 for any free port). Returns once the listener is
/// registered; no acknowledgment exists, so the daemon closing the connection is the signal.
pub async fn listen(socket_path: &Path, port: u16) -> Result<()> {
    match send_command(socket_path, CommandType::Listen, port).await? {
        None => Ok(()),
        Some(reply) => Err(ForwardError::UnexpectedReply(reply)),
    }
}

/// Ask the daemon to stop forwarding `port`.
pub async fn unlisten(socket_path: &Path, port: u16) -> Result<()> {
    match send_command(socket_path, CommandType::Unlisten, port).await? {
        Some(Command {
            kind: CommandType::UnlistenSuccess,
            ..
        }) => Ok(()),
        Some(Command {
            kind: CommandType::UnlistenError,
            ..
        }) => Err(ForwardError::UnknownPort(port)),
        Some(reply) => Err(ForwardError::UnexpectedReply(reply)),
        None => Err(ProtocolError::Truncated {
            read: 0,
            expected: FRAME_LEN,
        }
        .into()),
    }
}

/// Open a connection that becomes the host side of the next forwarding pair on `port`.
/// If the daemon has no listener for `port`, the returned stream is simply closed by the peer.
pub async fn open_data_connection(socket_path: &Path, port: u16) -> Result<UnixStream> {
    let mut conn = UnixStream::connect(socket_path).await?;
    command::write_command(&mut conn, CommandType::DataConnection, port).await?;
    Ok(conn)
}
