use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use tracewire_common::protocol::error::{Result, TraceWireError};
use tracewire_common::transport::{spawn_writer, FramedTransport, MessageSender};
use tracewire_common::{
    InvocationCorrelator, OpCode, Payload, ProtocolInvocation, ProtocolMessage, ProtocolResponse,
    PING_PAYLOAD,
};
use tracewire_trace::TraceEvent;

use crate::config::AgentConfig;
use crate::dispatcher::{CorrelatorListener, HandshakeListener, ResponseDispatcher, TraceAckListener};
use crate::state::ConnectionState;

/// Tasks and sender belonging to one live control channel.
struct Connection {
    outbound: MessageSender,
    reader: JoinHandle<()>,
    writer: JoinHandle<Result<()>>,
    sweeper: JoinHandle<()>,
}

impl Connection {
    fn abort(self) {
        self.reader.abort();
        self.writer.abort();
        self.sweeper.abort();
    }
}

/// Agent side of the control channel.
///
/// One client owns at most one connection. Synchronous operations (CONNECT,
/// PING) are correlated through an [`InvocationCorrelator`]; TRACE shipments
/// are fire-and-forget and acknowledged asynchronously.
pub struct AgentClient {
    config: AgentConfig,
    correlator: InvocationCorrelator,
    dispatcher: Arc<ResponseDispatcher>,
    state: Arc<watch::Sender<ConnectionState>>,
    acks: Arc<TraceAckListener>,
    connection: Mutex<Option<Connection>>,
    ops: AtomicU64,
    failed_ops: AtomicU64,
}

impl AgentClient {
    pub fn new(config: AgentConfig) -> Self {
        let correlator = InvocationCorrelator::new(config.operation_timeout);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let state = Arc::new(state_tx);
        let acks = Arc::new(TraceAckListener::default());

        // The handshake listener must bind the session before the waiter wakes.
        let dispatcher = Arc::new(ResponseDispatcher::new());
        dispatcher.add_listener(Arc::new(HandshakeListener::new(state.clone())));
        dispatcher.add_listener(Arc::new(CorrelatorListener::new(correlator.clone())));
        dispatcher.add_listener(acks.clone());

        AgentClient {
            config,
            correlator,
            dispatcher,
            state,
            acks,
            connection: Mutex::new(None),
            ops: AtomicU64::new(0),
            failed_ops: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.borrow().session_id().map(str::to_string)
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    pub fn pending_count(&self) -> usize {
        self.correlator.pending_count()
    }

    /// Operations attempted through this client.
    pub fn op_count(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    pub fn failed_op_count(&self) -> u64 {
        self.failed_ops.load(Ordering::Relaxed)
    }

    /// Traces the server has acknowledged so far.
    pub fn acknowledged_traces(&self) -> u64 {
        self.acks.acknowledged()
    }

    fn set_state(&self, state: ConnectionState) {
        tracing::debug!(%state, "Connection state changed");
        self.state.send_replace(state);
    }

    /// Opens the control channel and performs the CONNECT handshake.
    ///
    /// Returns the session id. Calling it while already connected returns the
    /// current session id without reconnecting.
    pub async fn connect(&self) -> Result<String> {
        let mut slot = self.connection.lock().await;
        if let (Some(_), Some(session_id)) = (slot.as_ref(), self.session_id()) {
            return Ok(session_id);
        }
        if let Some(stale) = slot.take() {
            stale.abort();
        }

        self.set_state(ConnectionState::Connecting);
        let stream = match FramedTransport::connect(&self.config.server_addr, self.config.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        tracing::info!(server = %self.config.server_addr, "Transport connected");

        let (read_half, write_half) = stream.into_split();
        let (outbound, rx) = MessageSender::channel(self.config.outbound_capacity);
        let writer = spawn_writer(write_half, rx);
        let reader = tokio::spawn(read_loop(
            read_half,
            self.dispatcher.clone(),
            self.correlator.clone(),
            self.state.clone(),
            outbound.clone(),
        ));
        let sweeper = self.correlator.spawn_sweeper(self.config.sweep_interval);
        let connection = Connection {
            outbound: outbound.clone(),
            reader,
            writer,
            sweeper,
        };

        self.set_state(ConnectionState::Handshaking);
        let handshake = ProtocolInvocation::new(
            OpCode::Connect,
            json!([self.config.host, self.config.agent_id]),
        );
        let outcome = self.track(
            self.correlator
                .send(&outbound, handshake, Some(self.config.operation_timeout))
                .await,
        );

        let session_id = match outcome {
            Ok(Some(Payload::String(session_id))) => session_id,
            Ok(other) => {
                connection.abort();
                self.set_state(ConnectionState::Disconnected);
                return Err(TraceWireError::InvalidResponse(format!(
                    "CONNECT returned {:?} instead of a session id",
                    other
                )));
            }
            Err(e) => {
                connection.abort();
                self.correlator.fail_all("handshake failed");
                self.set_state(ConnectionState::Disconnected);
                tracing::warn!(server = %self.config.server_addr, "Handshake failed: {}", e);
                return Err(e);
            }
        };

        // The listener has normally bound the session already; this covers a
        // transition the listener skipped.
        self.state.send_if_modified(|state| {
            if state.is_connected() {
                false
            } else {
                *state = ConnectionState::Connected {
                    session_id: session_id.clone(),
                };
                true
            }
        });

        *slot = Some(connection);
        Ok(session_id)
    }

    async fn outbound(&self) -> Result<MessageSender> {
        if !self.is_connected() {
            return Err(TraceWireError::NotConnected);
        }
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|c| c.outbound.clone())
            .ok_or(TraceWireError::NotConnected)
    }

    fn track<T>(&self, result: Result<T>) -> Result<T> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            self.failed_ops.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Round-trips a PING and returns the elapsed time.
    pub async fn ping(&self) -> Result<Duration> {
        let outbound = self.outbound().await?;
        let started = Instant::now();
        let result = self
            .correlator
            .send(
                &outbound,
                ProtocolInvocation::new(OpCode::Ping, json!(PING_PAYLOAD)),
                Some(self.config.operation_timeout),
            )
            .await
            .and_then(|payload| match payload {
                Some(Payload::String(echo)) if echo == PING_PAYLOAD => Ok(started.elapsed()),
                other => Err(TraceWireError::InvalidResponse(format!(
                    "PING echoed {:?}",
                    other
                ))),
            });
        self.track(result)
    }

    /// Ships traces to the server without waiting for acknowledgement.
    pub async fn submit_traces(&self, traces: Vec<TraceEvent>) -> Result<()> {
        if traces.is_empty() {
            return Ok(());
        }
        let outbound = self.outbound().await?;
        let count = traces.len();
        let payload = serde_json::to_value(traces)?;
        let result = self
            .correlator
            .send(&outbound, ProtocolInvocation::new(OpCode::Trace, payload), None)
            .await
            .map(|_| ());
        if result.is_ok() {
            tracing::debug!(count, "Shipped traces");
        }
        self.track(result)
    }

    /// Sends an invocation with a raw op code, for operations this build has no
    /// dedicated method for. Synchronous ops wait for the response.
    pub async fn invoke(&self, op_code: i32, payload: Payload) -> Result<Option<Payload>> {
        let outbound = self.outbound().await?;
        let result = self
            .correlator
            .send(
                &outbound,
                ProtocolInvocation::with_code(op_code, payload),
                Some(self.config.operation_timeout),
            )
            .await;
        self.track(result)
    }

    /// Closes the control channel. Pending invocations fail with
    /// [`TraceWireError::ConnectionLost`].
    pub async fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.abort();
            let failed = self.correlator.fail_all("agent disconnected");
            tracing::info!(server = %self.config.server_addr, failed, "Disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.abort();
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    dispatcher: Arc<ResponseDispatcher>,
    correlator: InvocationCorrelator,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound: MessageSender,
) {
    let reason = loop {
        match FramedTransport::read_message(&mut reader).await {
            Ok(Some(ProtocolMessage::Response(response))) => {
                dispatcher.dispatch(&response);
            }
            Ok(Some(ProtocolMessage::Invocation(invocation))) => {
                tracing::warn!(
                    request_id = invocation.request_id(),
                    op_code = invocation.op_code(),
                    "Agent received an invocation; rejecting"
                );
                if !invocation.is_async() {
                    let reply = ProtocolResponse::error(&invocation, "agents do not accept invocations");
                    if outbound.send(reply).await.is_err() {
                        break "outbound channel closed".to_string();
                    }
                }
            }
            Ok(None) => break "server closed the connection".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    let failed = correlator.fail_all(&reason);
    state.send_replace(ConnectionState::Disconnected);
    tracing::info!(failed, "Control channel closed: {}", reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_server, test_config as config, Behaviour};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_binds_session() {
        let client = AgentClient::new(config(fake_server(Behaviour::Normal).await));
        assert_eq!(client.state(), ConnectionState::Disconnected);

        assert_eq!(client.connect().await.unwrap(), "S1");
        assert!(client.is_connected());
        assert_eq!(client.session_id().as_deref(), Some("S1"));
        assert_eq!(client.pending_count(), 0);

        // Already connected: no second handshake.
        assert_eq!(client.connect().await.unwrap(), "S1");
        assert_eq!(client.op_count(), 1);
    }

    #[tokio::test]
    async fn test_ping_and_trace_round_trip() {
        let client = AgentClient::new(config(fake_server(Behaviour::Normal).await));
        client.connect().await.unwrap();

        client.ping().await.unwrap();

        let traces: Vec<TraceEvent> = (0..4)
            .map(|i| TraceEvent::new(format!("hostA/agentX:m{}", i), tracewire_trace::MetricType::LongAvg, json!(i)))
            .collect();
        client.submit_traces(traces).await.unwrap();
        assert_eq!(client.pending_count(), 0);

        // The ack arrives asynchronously; a PING behind it on the same channel
        // guarantees it has been read.
        client.ping().await.unwrap();
        assert_eq!(client.acknowledged_traces(), 4);
    }

    #[tokio::test]
    async fn test_unknown_op_fails_explicitly() {
        let client = AgentClient::new(config(fake_server(Behaviour::Normal).await));
        client.connect().await.unwrap();

        let err = client.invoke(42, json!(null)).await.unwrap_err();
        assert!(matches!(err, TraceWireError::Remote(_)));
        assert_eq!(client.failed_op_count(), 1);
    }

    #[tokio::test]
    async fn test_ping_times_out_when_server_is_silent() {
        let client = AgentClient::new(config(fake_server(Behaviour::Silent).await));
        client.connect().await.unwrap();

        let started = Instant::now();
        let err = client.ping().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_and_disconnects() {
        let client = AgentClient::new(config(fake_server(Behaviour::HangUp).await));
        client.connect().await.unwrap();
        let mut states = client.watch_state();

        let err = client.ping().await.unwrap_err();
        assert!(err.is_connection_lost() || err.is_timeout());

        tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| *s == ConnectionState::Disconnected))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(client.ping().await, Err(TraceWireError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_refused_leaves_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = AgentClient::new(config(addr));
        assert!(client.connect().await.is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let client = AgentClient::new(AgentConfig::default());
        assert!(matches!(client.ping().await, Err(TraceWireError::NotConnected)));
        assert!(matches!(
            client.submit_traces(vec![TraceEvent::new("x", tracewire_trace::MetricType::LongAvg, json!(1))]).await,
            Err(TraceWireError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_resets_state() {
        let client = AgentClient::new(config(fake_server(Behaviour::Normal).await));
        client.connect().await.unwrap();
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.session_id().is_none());
    }
}
