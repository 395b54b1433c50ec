//! Fan-out of inbound responses to interested listeners.
//!
//! Every response read off the control channel goes to each registered
//! [`ResponseListener`] whose [`accepts`](ResponseListener::accepts) filter
//! matches, in registration order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::watch;
use tracewire_common::{InvocationCorrelator, OpCode, ProtocolResponse};

use crate::state::ConnectionState;

pub trait ResponseListener: Send + Sync {
    /// Filter deciding whether this listener sees `response`.
    fn accepts(&self, response: &ProtocolResponse) -> bool;

    fn on_response(&self, response: &ProtocolResponse);
}

#[derive(Default)]
pub struct ResponseDispatcher {
    listeners: RwLock<Vec<Arc<dyn ResponseListener>>>,
    unhandled: AtomicU64,
}

impl ResponseDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn ResponseListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Delivers `response` to every accepting listener. Returns how many saw it.
    pub fn dispatch(&self, response: &ProtocolResponse) -> usize {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut delivered = 0;
        for listener in listeners.iter().filter(|l| l.accepts(response)) {
            listener.on_response(response);
            delivered += 1;
        }
        if delivered == 0 {
            self.unhandled.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                request_id = response.request_id(),
                op_code = response.op_code(),
                "No listener accepted response"
            );
        }
        delivered
    }

    /// Responses no listener accepted.
    pub fn unhandled_count(&self) -> u64 {
        self.unhandled.load(Ordering::Relaxed)
    }
}

/// Resolves pending synchronous invocations. Fire-and-forget acks are skipped.
pub struct CorrelatorListener {
    correlator: InvocationCorrelator,
}

impl CorrelatorListener {
    pub fn new(correlator: InvocationCorrelator) -> Self {
        CorrelatorListener { correlator }
    }
}

impl ResponseListener for CorrelatorListener {
    fn accepts(&self, response: &ProtocolResponse) -> bool {
        response.op().map(|op| !op.is_async()).unwrap_or(true)
    }

    fn on_response(&self, response: &ProtocolResponse) {
        self.correlator.on_response(response.clone());
    }
}

/// Binds the session id from a successful CONNECT response into the connection state.
pub struct HandshakeListener {
    state: Arc<watch::Sender<ConnectionState>>,
}

impl HandshakeListener {
    pub fn new(state: Arc<watch::Sender<ConnectionState>>) -> Self {
        HandshakeListener { state }
    }
}

impl ResponseListener for HandshakeListener {
    fn accepts(&self, response: &ProtocolResponse) -> bool {
        response.is_op(OpCode::Connect)
    }

    fn on_response(&self, response: &ProtocolResponse) {
        if let Some(error) = &response.error {
            tracing::warn!(request_id = response.request_id(), "Handshake rejected: {}", error);
            return;
        }
        match response.payload.as_ref().and_then(|p| p.as_str()) {
            Some(session_id) => {
                let bound = self.state.send_if_modified(|state| {
                    if *state == ConnectionState::Handshaking {
                        *state = ConnectionState::Connected {
                            session_id: session_id.to_string(),
                        };
                        true
                    } else {
                        false
                    }
                });
                if bound {
                    tracing::info!(session_id, "Session established");
                } else {
                    tracing::debug!(session_id, "Ignoring CONNECT response outside handshake");
                }
            }
            None => tracing::warn!(
                request_id = response.request_id(),
                "CONNECT response carried no session id"
            ),
        }
    }
}

/// Accumulates the trace counts the server acknowledges for TRACE shipments.
#[derive(Default)]
pub struct TraceAckListener {
    acknowledged: AtomicU64,
    batches: AtomicU64,
}

impl TraceAckListener {
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

impl ResponseListener for TraceAckListener {
    fn accepts(&self, response: &ProtocolResponse) -> bool {
        response.is_op(OpCode::Trace)
    }

    fn on_response(&self, response: &ProtocolResponse) {
        if let Some(error) = &response.error {
            tracing::warn!(request_id = response.request_id(), "Server rejected traces: {}", error);
            return;
        }
        let count = response.payload.as_ref().and_then(|p| p.as_u64()).unwrap_or(0);
        self.acknowledged.fetch_add(count, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
    }
}
