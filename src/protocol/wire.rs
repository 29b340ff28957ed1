//! Wire format for message framing.
//!
//! Messages are length-prefixed: [4 bytes big-endian u32][payload]

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};

use crate::error::{DaemonError, ProtocolErrorKind};

/// Default cap on a single handshake packet.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4096;

/// Read a length-prefixed message from the reader.
///
/// Returns the raw bytes of the message payload.
/// Returns an error if the message is too large or if reading fails.
pub async fn read_message<R>(reader: &mut R, max_size: usize) -> Result<Vec<u8>, DaemonError>
where
    R: AsyncReadExt + Unpin,
{
    // Read the 4-byte length prefix
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(DaemonError::Protocol {
                kind: ProtocolErrorKind::ConnectionClosed,
            });
        }
        Err(e) => return Err(DaemonError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_size {
        return Err(DaemonError::Protocol {
            kind: ProtocolErrorKind::MessageTooLarge {
                size: len,
                max: max_size,
            },
        });
    }

    let mut buf = vec![0u8; len];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(buf),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(DaemonError::Protocol {
            kind: ProtocolErrorKind::ConnectionClosed,
        }),
        Err(e) => Err(DaemonError::Io(e)),
    }
}

/// Write a length-prefixed message to the writer.
pub async fn write_message<W>(writer: &mut W, data: &[u8]) -> Result<(), DaemonError>
where
    W: AsyncWriteExt + Unpin,
{
    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one text line packet, giving up at `deadline`.
///
/// The payload must be ASCII; the trailing newline is kept so callers can
/// apply length bounds to exactly what was sent.
pub async fn read_line_until<R>(
    reader: &mut R,
    max_size: usize,
    deadline: Instant,
) -> Result<String, DaemonError>
where
    R: AsyncReadExt + Unpin,
{
    let bytes = timeout_at(deadline, read_message(reader, max_size))
        .await
        .map_err(|_| DaemonError::Protocol {
            kind: ProtocolErrorKind::ConnectionTimeout,
        })??;

    if !bytes.is_ascii() {
        return Err(DaemonError::Protocol {
            kind: ProtocolErrorKind::InvalidMessageFormat {
                message: "non-ASCII handshake line".to_string(),
            },
        });
    }

    String::from_utf8(bytes).map_err(|e| DaemonError::Protocol {
        kind: ProtocolErrorKind::InvalidMessageFormat {
            message: e.to_string(),
        },
    })
}

/// Write a length-prefixed message with a timeout.
///
/// Returns a ConnectionTimeout error if the write takes longer than the specified duration.
pub async fn write_message_with_timeout<W>(
    writer: &mut W,
    data: &[u8],
    timeout_duration: Duration,
) -> Result<(), DaemonError>
where
    W: AsyncWriteExt + Unpin,
{
    timeout(timeout_duration, write_message(writer, data))
        .await
        .map_err(|_| DaemonError::Protocol {
            kind: ProtocolErrorKind::ConnectionTimeout,
        })?
}
