use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use tracewire_common::protocol::error::{Result, TraceWireError};
use tracewire_common::transport::{spawn_writer, FramedTransport, MessageSender, DEFAULT_OUTBOUND_CAPACITY};
use tracewire_common::ProtocolMessage;

use crate::invoker::ServerInvoker;
use crate::session::{ChannelContext, ChannelId};

/// Async TCP server for TraceWire agents.
///
/// Accepts connections in a loop and spawns one task per connection. Each
/// connection gets a channel id; frames are decoded with the shared codec and
/// answered by the [`ServerInvoker`]. When the connection closes, its session
/// is removed from the registry.
pub struct TraceServer {
    listener: TcpListener,
    invoker: Arc<ServerInvoker>,
    outbound_capacity: usize,
    next_channel: AtomicU64,
}

impl TraceServer {
    /// Binds the listener.
    ///
    /// # Arguments
    /// * `bind_addr` - The address to bind to (e.g., "0.0.0.0:9428")
    /// * `invoker` - Answers every invocation received
    pub async fn bind(bind_addr: &str, invoker: Arc<ServerInvoker>) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| TraceWireError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self {
            listener,
            invoker,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            next_channel: AtomicU64::new(0),
        })
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| TraceWireError::Connection(format!("Failed to get local addr: {}", e)))
    }

    pub fn invoker(&self) -> &Arc<ServerInvoker> {
        &self.invoker
    }

    /// Accepts connections until an accept fails.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` completes. Connections already
    /// accepted keep running on their own tasks.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!("TraceWire server listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("TraceWire server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted
                    .map_err(|e| TraceWireError::Connection(format!("Failed to accept connection: {}", e)))?,
            };

            let channel = ChannelContext {
                channel_id: self.next_channel.fetch_add(1, Ordering::Relaxed) + 1,
                peer,
            };
            tracing::debug!(channel_id = channel.channel_id, peer = %peer, "Connection established");

            let invoker = self.invoker.clone();
            let capacity = self.outbound_capacity;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, channel, invoker.clone(), capacity).await {
                    tracing::warn!(channel_id = channel.channel_id, peer = %peer, "Connection error: {}", e);
                }
                release_channel(&invoker, channel.channel_id);
            });
        }
    }
}

fn release_channel(invoker: &ServerInvoker, channel_id: ChannelId) {
    if let Some(session) = invoker.registry().remove(channel_id) {
        tracing::info!(session_id = %session.session_id, host = %session.host, "Agent disconnected");
    }
}

/// Reads invocations until the peer closes, answering each through the
/// connection's writer task.
async fn handle_connection(
    stream: TcpStream,
    channel: ChannelContext,
    invoker: Arc<ServerInvoker>,
    outbound_capacity: usize,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();
    let (outbound, rx) = MessageSender::channel(outbound_capacity);
    let writer = spawn_writer(writer, rx);

    let result = read_loop(&mut reader, channel, &invoker, &outbound).await;

    // Closing the sender lets the writer drain what is queued and exit.
    drop(outbound);
    match writer.await {
        Ok(Ok(())) => result,
        Ok(Err(e)) => result.and(Err(e)),
        Err(e) => result.and(Err(TraceWireError::Transport(format!("writer task failed: {}", e)))),
    }
}

async fn read_loop<R>(
    reader: &mut R,
    channel: ChannelContext,
    invoker: &ServerInvoker,
    outbound: &MessageSender,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match FramedTransport::read_message(reader).await? {
            Some(ProtocolMessage::Invocation(invocation)) => {
                let response = invoker.invoke(&invocation, channel);
                outbound.send(response).await?;
            }
            Some(ProtocolMessage::Response(response)) => {
                tracing::debug!(
                    channel_id = channel.channel_id,
                    request_id = response.request_id(),
                    "Dropping response from agent; server sends no invocations"
                );
            }
            None => {
                tracing::debug!(channel_id = channel.channel_id, "Connection closed by peer");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AgentSession, SessionRegistry};
    use crate::sink::TraceSink;
    use serde_json::json;
    use std::time::Duration;
    use tracewire_common::{OpCode, ProtocolInvocation};
    use tracewire_trace::TraceEvent;

    struct CountingSink;

    impl TraceSink for CountingSink {
        fn accept(&self, _session: Option<&AgentSession>, traces: Vec<TraceEvent>) -> tracewire_trace::Result<usize> {
            Ok(traces.len())
        }
    }

    async fn start() -> (SocketAddr, Arc<ServerInvoker>) {
        let invoker = Arc::new(ServerInvoker::new(
            Arc::new(SessionRegistry::new("test")),
            Arc::new(CountingSink),
        ));
        let server = TraceServer::bind("127.0.0.1:0", invoker.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move { server.run().await });
        (addr, invoker)
    }

    async fn call(stream: &mut TcpStream, invocation: ProtocolInvocation) -> tracewire_common::ProtocolResponse {
        FramedTransport::write_message(stream, &invocation.into()).await.unwrap();
        match FramedTransport::read_message(stream).await.unwrap() {
            Some(ProtocolMessage::Response(response)) => response,
            other => panic!("expected a response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bind_and_local_addr() {
        let invoker = Arc::new(ServerInvoker::new(
            Arc::new(SessionRegistry::new("test")),
            Arc::new(CountingSink),
        ));
        let server = TraceServer::bind("127.0.0.1:0", invoker).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_handshake_and_ping_over_tcp() {
        let (addr, invoker) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let connect = call(&mut stream, ProtocolInvocation::new(OpCode::Connect, json!(["h", "a"]))).await;
        let session_id = connect.into_result().unwrap();
        assert_eq!(session_id, json!("test:1"));
        assert_eq!(invoker.registry().len(), 1);

        let pong = call(&mut stream, ProtocolInvocation::new(OpCode::Ping, json!("PING"))).await;
        assert_eq!(pong.into_result().unwrap(), json!("PING"));
    }

    #[tokio::test]
    async fn test_session_removed_when_connection_closes() {
        let (addr, invoker) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        call(&mut stream, ProtocolInvocation::new(OpCode::Connect, json!(["h", "a"]))).await;
        assert_eq!(invoker.registry().len(), 1);

        drop(stream);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !invoker.registry().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_each_connection_gets_its_own_channel() {
        let (addr, _) = start().await;
        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();

        let a = call(&mut first, ProtocolInvocation::new(OpCode::Connect, json!(["h1", "a"]))).await;
        let b = call(&mut second, ProtocolInvocation::new(OpCode::Connect, json!(["h2", "a"]))).await;
        assert_ne!(a.into_result().unwrap(), b.into_result().unwrap());
    }

    #[tokio::test]
    async fn test_run_until_stops_accepting() {
        let invoker = Arc::new(ServerInvoker::new(
            Arc::new(SessionRegistry::new("test")),
            Arc::new(CountingSink),
        ));
        let server = TraceServer::bind("127.0.0.1:0", invoker).await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = rx.await;
                })
                .await
        });
        tx.send(()).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
