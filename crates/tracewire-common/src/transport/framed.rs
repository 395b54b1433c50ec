use std::net::ToSocketAddrs;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::error::{Result, TraceWireError};
use crate::protocol::ProtocolMessage;
use crate::transport::codec::JsonCodec;

/// Maximum frame size (100 MB)
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Length-prefixed framing for the control channel.
///
/// # Wire Protocol
///
/// Every message is sent with a 4-byte length prefix (big-endian u32)
/// followed by the JSON-encoded [`ProtocolMessage`]:
///
/// ```text
/// [4-byte length] [JSON data]
/// ```
///
/// The functions are generic over the stream halves so the agent and server
/// can read and write from separate tasks after `TcpStream::into_split`.
pub struct FramedTransport;

impl FramedTransport {
    /// Connects to a remote endpoint, trying each resolved address in turn.
    pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
        let socket_addrs = addr
            .to_socket_addrs()
            .map_err(|e| TraceWireError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match tokio::time::timeout(timeout, TcpStream::connect(&socket_addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(_) => {
                    last_err = Some(format!("timed out after {}ms", timeout.as_millis()))
                }
            }
        }

        Err(TraceWireError::Connection(format!(
            "Failed to connect to {}: {}",
            addr,
            last_err.unwrap_or_else(|| "Unknown error".to_string())
        )))
    }

    /// Encodes and writes one message.
    pub async fn write_message<W>(writer: &mut W, message: &ProtocolMessage) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = JsonCodec::encode(message)?;
        Self::write_frame(writer, &encoded).await
    }

    /// Reads and decodes one message.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
    pub async fn read_message<R>(reader: &mut R) -> Result<Option<ProtocolMessage>>
    where
        R: AsyncRead + Unpin,
    {
        match Self::read_frame(reader).await? {
            Some(data) => Ok(Some(JsonCodec::decode(&data)?)),
            None => Ok(None),
        }
    }

    /// Writes a frame: `[4-byte length as u32 big-endian] + [data]`
    pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(TraceWireError::Transport(format!(
                "Message too large: {} bytes (max {} bytes)",
                data.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        let len = data.len() as u32;

        writer
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| Self::map_io_error(e, "writing length prefix"))?;
        writer
            .write_all(data)
            .await
            .map_err(|e| Self::map_io_error(e, "writing data"))?;
        writer
            .flush()
            .await
            .map_err(|e| Self::map_io_error(e, "flushing stream"))?;

        Ok(())
    }

    /// Reads a frame written by [`write_frame`](Self::write_frame).
    pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Self::map_io_error(e, "reading length prefix")),
        }

        let len = u32::from_be_bytes(len_buf) as usize;

        // Validate length to prevent allocation of excessively large buffers
        if len > MAX_MESSAGE_SIZE {
            return Err(TraceWireError::InvalidResponse(format!(
                "Message too large: {} bytes (max {} bytes)",
                len, MAX_MESSAGE_SIZE
            )));
        }

        let mut buf = vec![0u8; len];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| Self::map_io_error(e, "reading data"))?;

        Ok(Some(buf))
    }

    /// Map IO errors to appropriate TraceWireError variants
    ///
    /// - Connection resets/aborts/EOF mid-frame -> `ConnectionLost`
    /// - Other IO errors -> `Io`
    fn map_io_error(err: std::io::Error, context: &str) -> TraceWireError {
        match err.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::UnexpectedEof => {
                TraceWireError::ConnectionLost(format!("{}: {}", context, err))
            }
            _ => TraceWireError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OpCode, ProtocolInvocation, ProtocolResponse};
    use serde_json::json;

    #[tokio::test]
    async fn test_message_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let inv = ProtocolInvocation::new(OpCode::Ping, json!("PING"));

        FramedTransport::write_message(&mut client, &inv.clone().into())
            .await
            .unwrap();
        let received = FramedTransport::read_message(&mut server).await.unwrap();
        assert_eq!(received, Some(ProtocolMessage::Invocation(inv.clone())));

        let resp = ProtocolResponse::success(&inv, json!("PING"));
        FramedTransport::write_message(&mut server, &resp.clone().into())
            .await
            .unwrap();
        let received = FramedTransport::read_message(&mut client).await.unwrap();
        assert_eq!(received, Some(ProtocolMessage::Response(resp)));
    }

    #[tokio::test]
    async fn test_clean_close_reads_none() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        assert!(FramedTransport::read_message(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let len = (MAX_MESSAGE_SIZE as u32) + 1;
        client.write_all(&len.to_be_bytes()).await.unwrap();
        let err = FramedTransport::read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, TraceWireError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_connection_lost() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        let err = FramedTransport::read_frame(&mut server).await.unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let result = FramedTransport::connect(&addr, Duration::from_millis(500)).await;
        assert!(matches!(result, Err(TraceWireError::Connection(_))));
    }
}
