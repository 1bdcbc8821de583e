//! Async framed I/O over any stream: 4-byte BE length + JSON payload.

use std::io;

use lanchat_core::wire::{self, LEN_SIZE};
use lanchat_core::Envelope;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one frame payload. `Ok(None)` on clean EOF before a new frame starts.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = wire::frame_len(len_buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Read one frame and parse it as `T`. The outer result is transport state; the inner one is
/// whether the payload parsed.
pub async fn read_json<R, T>(reader: &mut R) -> io::Result<Option<Result<T, serde_json::Error>>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    Ok(read_frame(reader)
        .await?
        .map(|payload| wire::decode_payload::<T>(&payload)))
}

pub async fn read_envelope<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<Result<Envelope, serde_json::Error>>> {
    read_json(reader).await
}

pub async fn write_json<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame =
        wire::encode_json_frame(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

pub async fn write_envelope<W: AsyncWrite + Unpin>(writer: &mut W, env: &Envelope) -> io::Result<()> {
    write_json(writer, env).await
}
