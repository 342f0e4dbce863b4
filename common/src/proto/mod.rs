use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod control;
pub mod import;
pub mod slave;
pub mod transfer;

/// Upper bound for a single json message line. Build output is truncated by
/// the sender well below this.
pub const MAX_LINE: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("i/o error on protocol socket")]
    Io(#[from] io::Error),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message of {0} bytes exceeds line limit")]
    Oversized(usize),
    #[error("frame of {0} bytes exceeds frame limit")]
    FrameTooLarge(u32),
    #[error("unknown frame tag: {0:#04x}")]
    UnknownFrame(u8),
    #[error("peer closed the connection mid-message")]
    Truncated,
}

pub type ProtoResult<T> = std::result::Result<T, ProtocolError>;

/// Writes one message as a json line and flushes.
pub async fn send<W, T>(stream: &mut W, msg: &T) -> ProtoResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    stream.write_all(&line).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one json line. `None` means the peer closed the connection cleanly
/// between messages. Unknown tags and other shape mismatches surface as
/// `Malformed`.
pub async fn recv<R, T>(stream: &mut R) -> ProtoResult<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let n = stream
        .take(MAX_LINE as u64 + 1)
        .read_line(&mut line)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if n > MAX_LINE {
        return Err(ProtocolError::Oversized(n));
    }
    if !line.ends_with('\n') {
        return Err(ProtocolError::Truncated);
    }
    let msg = serde_json::from_str(line.trim_end())?;
    Ok(Some(msg))
}
