//! Length-prefixed bincode wire protocol.
//!
//! Frame format: [4-byte length (u32 big-endian)][bincode payload]
//! Maximum frame size: 4MB (prevents memory exhaustion attacks)
//!
//! Both directions report the number of bytes moved (prefix included) so
//! the peer engine can keep its traffic statistics.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::PeerError;
use crate::message::NetworkMessage;

/// Maximum allowed frame size (4MB)
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Serialize a NetworkMessage and write it as a length-prefixed frame.
/// Returns the total number of bytes written.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &NetworkMessage,
) -> Result<usize, PeerError> {
    let payload = bincode::serialize(message).map_err(|e| PeerError::Malformed(e.to_string()))?;

    let len = payload.len() as u32;
    if len > MAX_FRAME_SIZE {
        return Err(PeerError::FrameTooLarge(len));
    }

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;

    Ok(4 + payload.len())
}

/// Read a length-prefixed frame and deserialize into a NetworkMessage.
/// Returns Ok(None) on clean EOF (connection closed between frames).
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<(NetworkMessage, usize)>, PeerError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(PeerError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;

    let message: NetworkMessage =
        bincode::deserialize(&payload).map_err(|e| PeerError::Malformed(e.to_string()))?;

    Ok(Some((message, 4 + payload.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip() {
        let msg = NetworkMessage::Ping { nonce: 42 };

        let mut buf = Vec::new();
        let written = write_message(&mut buf, &msg).await.unwrap();
        assert_eq!(written, buf.len());

        let mut cursor = std::io::Cursor::new(buf);
        let (result, read) = read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(read, written);

        match result {
            NetworkMessage::Ping { nonce } => assert_eq!(nonce, 42),
            other => panic!("wrong message type: {}", other.command()),
        }
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_message(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let len = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut cursor = std::io::Cursor::new(len.to_vec());
        let result = read_message(&mut cursor).await;
        assert!(matches!(result, Err(PeerError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_garbage_payload_is_malformed() {
        let mut frame = 4u32.to_be_bytes().to_vec();
        frame.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        let mut cursor = std::io::Cursor::new(frame);
        let err = read_message(&mut cursor).await.unwrap_err();
        assert!(err.is_malformed());
    }
}
