use crate::config::CHUNK_SIZE;
use crate::proto::{ProtoResult, ProtocolError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame we accept: one chunk payload plus the frame header.
pub const MAX_FRAME: u32 = CHUNK_SIZE + 16;

const TAG_HELLO: u8 = 0x01;
const TAG_FETCH: u8 = 0x02;
const TAG_CHUNK: u8 = 0x03;
const TAG_DONE: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneCode {
    Ok,
    Retry,
    Error,
}

impl DoneCode {
    fn from_u8(code: u8) -> ProtoResult<DoneCode> {
        match code {
            0 => Ok(DoneCode::Ok),
            1 => Ok(DoneCode::Retry),
            2 => Ok(DoneCode::Error),
            _ => Err(ProtocolError::UnknownFrame(code)),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            DoneCode::Ok => 0,
            DoneCode::Retry => 1,
            DoneCode::Error => 2,
        }
    }
}

/// Binary frames on the file transfer socket. Layout: u32 BE payload length,
/// u8 tag, payload. The receiver drives the exchange with `Fetch`, the
/// sender answers with `Chunk`; chunks may be re-requested in any order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFrame {
    Hello { slave_id: u32 },
    Fetch { index: u32, size: u32 },
    Chunk { index: u32, data: Vec<u8> },
    Done { code: DoneCode },
}

impl TransferFrame {
    pub async fn read_from<R: AsyncRead + Unpin>(stream: &mut R) -> ProtoResult<Option<TransferFrame>> {
        let mut header = [0u8; 4];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(header);
        if len == 0 || len > MAX_FRAME {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        let mut payload = vec![0u8; len as usize];
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::UnexpectedEof => ProtocolError::Truncated,
                _ => ProtocolError::Io(err),
            })?;

        let tag = payload[0];
        let body = &payload[1..];
        let frame = match tag {
            TAG_HELLO => TransferFrame::Hello {
                slave_id: read_u32(body, 0)?,
            },
            TAG_FETCH => TransferFrame::Fetch {
                index: read_u32(body, 0)?,
                size: read_u32(body, 4)?,
            },
            TAG_CHUNK => TransferFrame::Chunk {
                index: read_u32(body, 0)?,
                data: body[4..].to_vec(),
            },
            TAG_DONE => TransferFrame::Done {
                code: DoneCode::from_u8(*body.first().ok_or(ProtocolError::Truncated)?)?,
            },
            other => return Err(ProtocolError::UnknownFrame(other)),
        };
        Ok(Some(frame))
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, stream: &mut W) -> ProtoResult<()> {
        let mut payload = Vec::with_capacity(16);
        match self {
            TransferFrame::Hello { slave_id } => {
                payload.push(TAG_HELLO);
                payload.extend_from_slice(&slave_id.to_be_bytes());
            }
            TransferFrame::Fetch { index, size } => {
                payload.push(TAG_FETCH);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&size.to_be_bytes());
            }
            TransferFrame::Chunk { index, data } => {
                payload.reserve(data.len() + 5);
                payload.push(TAG_CHUNK);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(data);
            }
            TransferFrame::Done { code } => {
                payload.push(TAG_DONE);
                payload.push(code.as_u8());
            }
        }
        let len = payload.len() as u32;
        if len > MAX_FRAME {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&payload).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Client side of the transfer protocol: connect, identify, then answer
/// `Fetch` frames from the file until the receiver settles on a verdict.
/// `Retry` restarts transparently; the final code comes back to the caller.
pub async fn upload_file(
    addr: &str,
    slave_id: u32,
    path: &std::path::Path,
) -> crate::errors::Result<DoneCode> {
    use crate::errors::Context;
    use tokio::io::{AsyncReadExt as _, AsyncSeekExt};

    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to file socket: {:?}", addr))?;
    let mut stream = tokio::io::BufStream::new(stream);
    TransferFrame::Hello { slave_id }.write_to(&mut stream).await?;

    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open upload source: {:?}", path))?;

    loop {
        match TransferFrame::read_from(&mut stream).await? {
            Some(TransferFrame::Fetch { index, size }) => {
                file.seek(std::io::SeekFrom::Start(index as u64 * CHUNK_SIZE as u64))
                    .await?;
                let mut data = vec![0u8; size as usize];
                file.read_exact(&mut data).await?;
                TransferFrame::Chunk { index, data }
                    .write_to(&mut stream)
                    .await?;
            }
            Some(TransferFrame::Done { code }) => match code {
                DoneCode::Retry => continue,
                code => return Ok(code),
            },
            Some(other) => {
                crate::errors::bail!("Unexpected frame during upload: {:?}", other)
            }
            None => crate::errors::bail!("File socket closed mid-upload"),
        }
    }
}

fn read_u32(body: &[u8], offset: usize) -> ProtoResult<u32> {
    let bytes = body
        .get(offset..offset + 4)
        .ok_or(ProtocolError::Truncated)?;
    Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn round_trip(frame: TransferFrame) -> TransferFrame {
        let mut buf = Cursor::new(Vec::new());
        frame.write_to(&mut buf).await.unwrap();
        let mut read = Cursor::new(buf.into_inner());
        TransferFrame::read_from(&mut read).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn frames_round_trip() {
        for frame in [
            TransferFrame::Hello { slave_id: 7 },
            TransferFrame::Fetch { index: 3, size: 65536 },
            TransferFrame::Chunk { index: 3, data: vec![0xAB; 512] },
            TransferFrame::Done { code: DoneCode::Retry },
        ] {
            assert_eq!(round_trip(frame.clone()).await, frame);
        }
    }

    #[tokio::test]
    async fn eof_between_frames_is_clean_close() {
        let mut read = Cursor::new(Vec::new());
        assert!(TransferFrame::read_from(&mut read).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME + 1).to_be_bytes());
        let mut read = Cursor::new(buf);
        assert!(matches!(
            TransferFrame::read_from(&mut read).await,
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn unknown_tag_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.push(0x7F);
        buf.push(0);
        let mut read = Cursor::new(buf);
        assert!(matches!(
            TransferFrame::read_from(&mut read).await,
            Err(ProtocolError::UnknownFrame(0x7F))
        ));
    }
}
