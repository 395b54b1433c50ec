use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracewire_common::{OpCode, Payload, ProtocolInvocation, ProtocolResponse};
use tracewire_trace::TraceEvent;

use crate::session::{ChannelContext, SessionRegistry};
use crate::sink::TraceSink;

/// Counters reported by [`ServerInvoker::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvokerStats {
    pub invocations: u64,
    pub failed: u64,
    pub unknown_ops: u64,
    pub traces_accepted: u64,
}

/// Answers the invocations agents send over their control channel.
///
/// Every invocation gets exactly one response, including TRACE (whose
/// response carries the accepted-trace count) and op codes this build does
/// not know (which get an error response).
pub struct ServerInvoker {
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn TraceSink>,
    invocations: AtomicU64,
    failed: AtomicU64,
    unknown_ops: AtomicU64,
    traces_accepted: AtomicU64,
}

impl ServerInvoker {
    pub fn new(registry: Arc<SessionRegistry>, sink: Arc<dyn TraceSink>) -> Self {
        ServerInvoker {
            registry,
            sink,
            invocations: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            unknown_ops: AtomicU64::new(0),
            traces_accepted: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> InvokerStats {
        InvokerStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unknown_ops: self.unknown_ops.load(Ordering::Relaxed),
            traces_accepted: self.traces_accepted.load(Ordering::Relaxed),
        }
    }

    pub fn invoke(&self, invocation: &ProtocolInvocation, channel: ChannelContext) -> ProtocolResponse {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let result = match invocation.op() {
            Ok(OpCode::Ping) => Ok(invocation.payload().clone()),
            Ok(OpCode::Connect) => self.connect(invocation.payload(), channel),
            Ok(OpCode::Trace) => self.trace(invocation.payload(), channel),
            Err(e) => {
                self.unknown_ops.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    request_id = invocation.request_id(),
                    op_code = invocation.op_code(),
                    peer = %channel.peer,
                    "Unknown operation"
                );
                Err(e.to_string())
            }
        };

        match result {
            Ok(payload) => ProtocolResponse::success(invocation, payload),
            Err(message) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                ProtocolResponse::error(invocation, message)
            }
        }
    }

    fn connect(&self, payload: &Payload, channel: ChannelContext) -> Result<Payload, String> {
        let (host, agent_id) = match payload.as_array().map(Vec::as_slice) {
            Some([host, agent_id]) => match (host.as_str(), agent_id.as_str()) {
                (Some(host), Some(agent_id)) => (host, agent_id),
                _ => return Err("CONNECT expects [host, agent_id] strings".to_string()),
            },
            _ => return Err("CONNECT expects [host, agent_id]".to_string()),
        };

        let (session_id, new) = self.registry.register(channel, host, agent_id);
        if new {
            tracing::info!(session_id = %session_id, host, agent_id, peer = %channel.peer, "Agent connected");
        } else {
            tracing::debug!(session_id = %session_id, "Repeated CONNECT on bound channel");
        }
        Ok(Payload::String(session_id))
    }

    fn trace(&self, payload: &Payload, channel: ChannelContext) -> Result<Payload, String> {
        let Some(session) = self.registry.get(channel.channel_id) else {
            tracing::warn!(peer = %channel.peer, "TRACE before CONNECT");
            return Err("no session bound to this channel; CONNECT first".to_string());
        };
        let traces: Vec<TraceEvent> =
            serde_json::from_value(payload.clone()).map_err(|e| format!("malformed trace payload: {}", e))?;
        let accepted = self
            .sink
            .accept(Some(&session), traces)
            .map_err(|e| {
                tracing::error!(session_id = %session.session_id, "Trace sink failed: {}", e);
                e.to_string()
            })?;
        self.traces_accepted.fetch_add(accepted as u64, Ordering::Relaxed);
        Ok(Payload::from(accepted))
    }
}
