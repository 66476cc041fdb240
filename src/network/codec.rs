// Wire format: [u32 big-endian length][bincode payload]
//
// The payload is the bincode encoding of `KvMessage`. Tensor bodies are plain
// vectors, which bincode writes as length + raw elements.

use super::protocol::KvMessage;
use crate::error::{KvError, Result};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub fn encode_message(msg: &KvMessage) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| KvError::Serialization(e.to_string()))
}

/// Undecodable bytes, including an unknown message-type tag, mean the peer
/// speaks a different protocol version.
pub fn decode_message(bytes: &[u8]) -> Result<KvMessage> {
    let msg: KvMessage = bincode::deserialize(bytes)
        .map_err(|e| KvError::Protocol(format!("failed to decode message: {}", e)))?;
    if let Some(payload) = &msg.payload {
        payload.validate().map_err(|e| {
            KvError::Protocol(format!("{} message carries a malformed tensor: {}", msg.kind, e))
        })?;
    }
    Ok(msg)
}

/// Read a `[u32 BE length][payload]` frame.
///
/// Returns `Ok(None)` on a clean end of stream before the length prefix.
pub async fn read_frame<R>(io: &mut R, max_bytes: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match io.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_bytes {
        return Err(KvError::Transport(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_bytes
        )));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write a `[u32 BE length][payload]` frame.
pub async fn write_frame<W>(io: &mut W, payload: &[u8], max_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max_bytes || payload.len() > u32::MAX as usize {
        return Err(KvError::Transport(format!(
            "frame of {} bytes exceeds limit of {}",
            payload.len(),
            max_bytes
        )));
    }
    io.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    io.write_all(payload).await?;
    io.flush().await?;
    Ok(())
}
