use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::error::{Result, TraceWireError};
use crate::protocol::ProtocolMessage;
use crate::transport::framed::FramedTransport;

/// Default number of outbound messages buffered per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Cloneable handle for queueing messages onto a connection's writer task.
///
/// Each connection owns exactly one writer task (see [`spawn_writer`]) so that
/// frames from concurrent senders are never interleaved on the socket.
#[derive(Clone, Debug)]
pub struct MessageSender {
    tx: mpsc::Sender<ProtocolMessage>,
}

impl MessageSender {
    /// Creates a sender and the receiver a writer task should drain.
    pub fn channel(capacity: usize) -> (MessageSender, mpsc::Receiver<ProtocolMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (MessageSender { tx }, rx)
    }

    /// Queues a message, waiting for buffer space if the writer is behind.
    pub async fn send(&self, message: impl Into<ProtocolMessage>) -> Result<()> {
        self.tx
            .send(message.into())
            .await
            .map_err(|_| TraceWireError::ConnectionLost("outbound channel closed".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawns the task that writes queued messages to `writer` until every
/// [`MessageSender`] is dropped or a write fails.
pub fn spawn_writer<W>(mut writer: W, mut rx: mpsc::Receiver<ProtocolMessage>) -> JoinHandle<Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = FramedTransport::write_message(&mut writer, &message).await {
                tracing::warn!(request_id = message.request_id(), "Failed to write frame: {}", e);
                rx.close();
                return Err(e);
            }
        }
        Ok(())
    })
}
