//! In-process stand-in for a TraceWire server, used by the unit tests.

use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tracewire_common::{FramedTransport, OpCode, ProtocolMessage, ProtocolResponse};

use crate::config::AgentConfig;

#[derive(Clone, Copy)]
pub(crate) enum Behaviour {
    /// Answers CONNECT with "S1", echoes PING, acknowledges TRACE with a count.
    Normal,
    /// Answers CONNECT, then never answers anything else.
    Silent,
    /// Answers CONNECT, then closes the connection on the next message.
    HangUp,
}

/// Accepts a single connection on an ephemeral port and returns its address.
pub(crate) async fn fake_server(behaviour: Behaviour) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while let Ok(Some(ProtocolMessage::Invocation(inv))) = FramedTransport::read_message(&mut stream).await {
            let reply = match (inv.op(), behaviour) {
                (Ok(OpCode::Connect), _) => ProtocolResponse::success(&inv, json!("S1")),
                (_, Behaviour::Silent) => continue,
                (_, Behaviour::HangUp) => return,
                (Ok(OpCode::Ping), Behaviour::Normal) => ProtocolResponse::success(&inv, inv.payload().clone()),
                (Ok(OpCode::Trace), Behaviour::Normal) => {
                    let count = inv.payload().as_array().map(|a| a.len()).unwrap_or(0);
                    ProtocolResponse::success(&inv, json!(count))
                }
                (Err(e), Behaviour::Normal) => ProtocolResponse::error(&inv, e.to_string()),
            };
            let message = ProtocolMessage::from(reply);
            if FramedTransport::write_message(&mut stream, &message).await.is_err() {
                return;
            }
        }
    });
    addr
}

pub(crate) fn test_config(addr: String) -> AgentConfig {
    AgentConfig {
        operation_timeout: Duration::from_millis(200),
        sweep_interval: Duration::from_millis(20),
        ..AgentConfig::default()
    }
    .with_server(addr)
    .with_identity("hostA", "agentX")
}
