use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{GatewayError, Result};
use crate::protocol::{GatewayMessage, MAX_PAYLOAD_SIZE, MESSAGE_HEADER_SIZE};

/// Writes one envelope plus its payload.
///
/// The header's `payload_size` is taken from `payload`, so callers never have
/// to keep the two in sync by hand. The header and payload are written as one
/// sequence; callers serialize concurrent writes on the same stream (the
/// gateway does this with a per-link writer task).
///
/// # Arguments
///
/// * `stream` - The stream to write to
/// * `message` - The envelope header
/// * `payload` - The inline payload to follow the header
///
/// # Errors
///
/// Returns an error if the payload exceeds the size cap or writing to the
/// stream fails
pub async fn write_message<W>(stream: &mut W, message: &GatewayMessage, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(GatewayError::Malformed(format!(
            "Payload too large: {} bytes (max {} bytes)",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    let mut header = *message;
    header.payload_size = payload.len() as u32;
    stream.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Reads one envelope plus its payload.
///
/// # Arguments
///
/// * `stream` - The stream to read from
///
/// # Returns
///
/// The decoded header and payload, or `None` when the peer closed the
/// connection cleanly at a frame boundary
///
/// # Errors
///
/// Returns an error if:
/// - EOF arrives in the middle of a frame
/// - `payload_size` exceeds the size cap
/// - Reading from the stream fails
pub async fn read_message<R>(stream: &mut R) -> Result<Option<(GatewayMessage, Bytes)>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; MESSAGE_HEADER_SIZE];
    match stream.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let message = GatewayMessage::decode(&header_buf);

    let payload_size = message.payload_size as usize;
    if payload_size > MAX_PAYLOAD_SIZE {
        return Err(GatewayError::Malformed(format!(
            "Payload too large: {} bytes (max {} bytes)",
            payload_size, MAX_PAYLOAD_SIZE
        )));
    }
    if payload_size == 0 {
        return Ok(Some((message, Bytes::new())));
    }
    let mut payload = vec![0u8; payload_size];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| GatewayError::Connection(format!("Failed to read payload: {}", e)))?;
    Ok(Some((message, Bytes::from(payload))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FuncCall;

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let msg = GatewayMessage::dispatch_func_call(FuncCall::new(7, 0, 1));
        write_message(&mut client, &msg, b"hi").await.unwrap();

        let (received, payload) = read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(received.func_call(), FuncCall::new(7, 0, 1));
        assert_eq!(received.payload_size, 2);
        assert_eq!(&payload[..], b"hi");
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let msg = GatewayMessage::engine_handshake(1, 0);
        write_message(&mut client, &msg, b"").await.unwrap();

        let (received, payload) = read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(received, msg);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_message(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_payload_size_validated_before_alloc() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let mut msg = GatewayMessage::engine_handshake(1, 0);
        msg.payload_size = (MAX_PAYLOAD_SIZE + 1) as u32;
        client.write_all(&msg.encode()).await.unwrap();

        let err = read_message(&mut server).await.unwrap_err();
        assert!(matches!(err, GatewayError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let first = GatewayMessage::func_call_complete(FuncCall::new(1, 0, 1), 10);
        let second = GatewayMessage::func_call_failed(FuncCall::new(1, 0, 2), 20);
        write_message(&mut client, &first, b"out").await.unwrap();
        write_message(&mut client, &second, b"").await.unwrap();

        let (a, pa) = read_message(&mut server).await.unwrap().unwrap();
        let (b, pb) = read_message(&mut server).await.unwrap().unwrap();
        assert_eq!(a.func_call().call_id, 1);
        assert_eq!(&pa[..], b"out");
        assert_eq!(b.func_call().call_id, 2);
        assert!(pb.is_empty());
    }
}
