//! Length-prefixed bincode wire protocol for P2P communication.
//!
//! Frame format: [4-byte length (u32 big-endian)][bincode payload]
//! Maximum frame size: 16MB. A full objects response carrying a whole sync
//! batch of block bodies must fit in one frame.

use crate::network::message::ProtocolMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Serialize a ProtocolMessage and write it as a length-prefixed frame.
/// Returns the number of bytes put on the wire.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &ProtocolMessage,
) -> Result<u64, String> {
    let payload =
        bincode::serialize(message).map_err(|e| format!("Failed to serialize message: {}", e))?;

    let len = payload.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(format!(
            "Message too large: {} bytes (max: {})",
            len, MAX_FRAME_SIZE
        ));
    }

    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| format!("Failed to write frame length: {}", e))?;

    writer
        .write_all(&payload)
        .await
        .map_err(|e| format!("Failed to write frame payload: {}", e))?;

    writer
        .flush()
        .await
        .map_err(|e| format!("Failed to flush: {}", e))?;

    Ok(4 + payload.len() as u64)
}

/// Read a length-prefixed frame and deserialize into a ProtocolMessage.
/// Returns Ok(None) on clean EOF (connection closed). On success the
/// message is returned with its wire size.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(ProtocolMessage, u64)>, String> {
    // Read 4-byte length prefix
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(format!("Failed to read frame length: {}", e)),
    }

    let len = u32::from_be_bytes(len_buf);

    if len > MAX_FRAME_SIZE {
        return Err(format!(
            "Frame too large: {} bytes (max: {})",
            len, MAX_FRAME_SIZE
        ));
    }

    // Read payload
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| format!("Failed to read frame payload: {}", e))?;

    let message: ProtocolMessage = bincode::deserialize(&payload)
        .map_err(|e| format!("Failed to deserialize message: {}", e))?;

    Ok(Some((message, 4 + len as u64)))
}
