//! Control protocol frames.
//!
//! Every message is exactly [`FRAME_LEN`] ASCII bytes: the port as five zero-padded decimal
//! digits, a `:`, then the command type as two zero-padded decimal digits (`08080:11` is
//! `LISTEN 8080`). There is no body.

use crate::error::ProtocolError;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const PORT_DIGITS: usize = 5;
const TYPE_DIGITS: usize = 2;

/// Length of one encoded command.
pub const FRAME_LEN: usize = PORT_DIGITS + 1 + TYPE_DIGITS;

/// Command type. Codes follow the numbering shared with the host-side forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    DataConnection,
    Listen,
    Unlisten,
    UnlistenError,
    UnlistenSuccess,
    /// A code this daemon does not act on.
    Unrecognized(u8),
}

impl CommandType {
    pub fn code(self) -> u8 {
        match self {
            CommandType::DataConnection => 7,
            CommandType::Listen => 11,
            CommandType::Unlisten => 12,
            CommandType::UnlistenError => 13,
            CommandType::UnlistenSuccess => 14,
            CommandType::Unrecognized(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            7 => CommandType::DataConnection,
            11 => CommandType::Listen,
            12 => CommandType::Unlisten,
            13 => CommandType::UnlistenError,
            14 => CommandType::UnlistenSuccess,
            other => CommandType::Unrecognized(other),
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandType::DataConnection => f.write_str("DATA_CONNECTION"),
            CommandType::Listen => f.write_str("LISTEN"),
            CommandType::Unlisten => f.write_str("UNLISTEN"),
            CommandType::UnlistenError => f.write_str("UNLISTEN_ERROR"),
            CommandType::UnlistenSuccess => f.write_str("UNLISTEN_SUCCESS"),
            CommandType::Unrecognized(code) => write!(f, "UNRECOGNIZED({})", code),
        }
    }
}

/// One decoded control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandType,
    pub port: u16,
}

impl Command {
    pub fn new(kind: CommandType, port: u16) -> Self {
        Self { kind, port }
    }

    /// Encode as a frame. Codes above 99 do not fit the two-digit type field.
    pub fn to_frame(&self) -> Result<[u8; FRAME_LEN], ProtocolError> {
        let code = self.kind.code();
        if code > 99 {
            return Err(ProtocolError::InvalidType(code.to_string()));
        }
        let text = format!("{:05}:{:02}", self.port, code);
        let mut frame = [0u8; FRAME_LEN];
        frame.copy_from_slice(text.as_bytes());
        Ok(frame)
    }

    pub fn parse(frame: &[u8; FRAME_LEN]) -> Result<Self, ProtocolError> {
        let (port_field, rest) = frame.split_at(PORT_DIGITS);
        let (sep, type_field) = rest.split_at(1);
        if sep != b":" {
            return Err(ProtocolError::MissingSeparator);
        }
        let port = parse_digits(port_field)
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| ProtocolError::InvalidPort(lossy(port_field)))?;
        let code = parse_digits(type_field)
            .and_then(|n| u8::try_from(n).ok())
            .ok_or_else(|| ProtocolError::InvalidType(lossy(type_field)))?;
        Ok(Self {
            kind: CommandType::from_code(code),
            port,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} port {}", self.kind, self.port)
    }
}

fn parse_digits(field: &[u8]) -> Option<u32> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return None;
    }
    Some(field.iter().fold(0u32, |acc, d| acc * 10 + u32::from(d - b'0')))
}

fn lossy(field: &[u8]) -> String {
    String::from_utf8_lossy(field).into_owned()
}

/// Read one frame. A connection that closes before a full frame is a [`ProtocolError`].
pub async fn read_command<R>(conn: &mut R) -> Result<Command, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match try_read_command(conn).await? {
        Some(command) => Ok(command),
        None => Err(ProtocolError::Truncated {
            read: 0,
            expected: FRAME_LEN,
        }),
    }
}

/// Like [`read_command`], but a clean close before the first byte yields `None`.
pub async fn try_read_command<R>(conn: &mut R) -> Result<Option<Command>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = [0u8; FRAME_LEN];
    let mut read = 0;
    while read < FRAME_LEN {
        let n = conn
            .read(&mut frame[read..])
            .await
            .map_err(ProtocolError::Io)?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Truncated {
                read,
                expected: FRAME_LEN,
            });
        }
        read += n;
    }
    Command::parse(&frame).map(Some)
}

/// Write one frame. A type code that cannot be encoded is an `InvalidInput` error and
/// nothing is written.
pub async fn write_command<W>(conn: &mut W, kind: CommandType, port: u16) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = Command::new(kind, port)
        .to_frame()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    conn.write_all(&frame).await?;
    conn.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(s: &str) -> [u8; FRAME_LEN] {
        s.as_bytes().try_into().expect("frame length")
    }

    #[test]
    fn encodes_padded_ascii() {
        assert_eq!(&Command::new(CommandType::Listen, 8080).to_frame().unwrap(), b"08080:11");
        assert_eq!(&Command::new(CommandType::UnlistenSuccess, 0).to_frame().unwrap(), b"00000:14");
        assert_eq!(&Command::new(CommandType::DataConnection, 65535).to_frame().unwrap(), b"65535:07");
        assert_eq!(&Command::new(CommandType::Unrecognized(99), 1).to_frame().unwrap(), b"00001:99");
    }

    #[tokio::test]
    async fn three_digit_type_code_is_not_encoded() {
        assert!(matches!(
            Command::new(CommandType::Unrecognized(150), 8080).to_frame(),
            Err(ProtocolError::InvalidType(code)) if code == "150"
        ));
        let (mut a, mut b) = tokio::io::duplex(64);
        let err = write_command(&mut a, CommandType::Unrecognized(150), 8080)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        drop(a);
        assert!(try_read_command(&mut b).await.unwrap().is_none());
    }

    #[test]
    fn parses_known_types() {
        assert_eq!(
            Command::parse(&frame("08080:11")).unwrap(),
            Command::new(CommandType::Listen, 8080)
        );
        assert_eq!(
            Command::parse(&frame("00022:12")).unwrap(),
            Command::new(CommandType::Unlisten, 22)
        );
        assert_eq!(
            Command::parse(&frame("00000:07")).unwrap(),
            Command::new(CommandType::DataConnection, 0)
        );
    }

    #[test]
    fn unknown_code_is_unrecognized_not_error() {
        let c = Command::parse(&frame("01234:10")).unwrap();
        assert_eq!(c.kind, CommandType::Unrecognized(10));
        assert_eq!(c.port, 1234);
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(
            Command::parse(&frame("08080-11")),
            Err(ProtocolError::MissingSeparator)
        ));
        assert!(matches!(
            Command::parse(&frame("0808a:11")),
            Err(ProtocolError::InvalidPort(_))
        ));
        assert!(matches!(
            Command::parse(&frame("70000:11")),
            Err(ProtocolError::InvalidPort(_))
        ));
        assert!(matches!(
            Command::parse(&frame("08080:+1")),
            Err(ProtocolError::InvalidType(_))
        ));
    }

    #[tokio::test]
    async fn short_read_is_truncated() {
        let mut conn: &[u8] = b"0808";
        match read_command(&mut conn).await {
            Err(ProtocolError::Truncated { read, expected }) => {
                assert_eq!(read, 4);
                assert_eq!(expected, FRAME_LEN);
            }
            other => panic!("expected truncated frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_stream_is_none_for_try_read() {
        let mut conn: &[u8] = b"";
        assert!(try_read_command(&mut conn).await.unwrap().is_none());
        let mut conn: &[u8] = b"";
        assert!(read_command(&mut conn).await.is_err());
    }

    #[tokio::test]
    async fn write_then_read_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_command(&mut a, CommandType::UnlistenError, 9000).await.unwrap();
        let c = read_command(&mut b).await.unwrap();
        assert_eq!(c, Command::new(CommandType::UnlistenError, 9000));
    }
}
