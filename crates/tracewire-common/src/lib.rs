//! TraceWire Common Types and Transport
//!
//! This crate provides the protocol envelopes, the framed TCP transport and the
//! invocation correlator shared by TraceWire agents and servers.
//!
//! # Overview
//!
//! Agents open a single control channel to a server. Over it they send
//! [`ProtocolInvocation`]s (CONNECT handshake, PING liveness checks and bulk
//! TRACE shipments) and receive [`ProtocolResponse`]s. Synchronous operations
//! are matched to their responses by request id through the
//! [`InvocationCorrelator`]; TRACE is fire-and-forget.
//!
//! # Architecture
//!
//! - **Transport**: TCP, one reader task and one writer task per connection
//! - **Serialization**: JSON
//! - **Message Format**: `[4-byte length prefix as u32 big-endian] + [JSON data]`
//! - **Max Message Size**: 100 MB
//!
//! # Components
//!
//! - [`protocol`] - Envelopes, op codes and the error taxonomy
//! - [`transport`] - Codec, framing and per-connection writer
//! - [`correlator`] - Pending-invocation table with timeouts
//! - [`config`] - `TRACEWIRE_*` environment helpers
//!
//! # Example
//!
//! ```no_run
//! use tracewire_common::{InvocationCorrelator, OpCode, ProtocolInvocation, ProtocolResponse};
//! use serde_json::json;
//!
//! # async fn demo() -> tracewire_common::Result<()> {
//! let correlator = InvocationCorrelator::default();
//! let invocation = ProtocolInvocation::new(OpCode::Connect, json!(["hostA", "agentX"]));
//! let pending = correlator.register(&invocation, None)?;
//!
//! // ...the reader task later delivers the server's answer
//! correlator.on_response(ProtocolResponse::success(&invocation, json!("S1")));
//! assert_eq!(pending.wait().await?, json!("S1"));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod correlator;
pub mod protocol;
pub mod transport;

pub use correlator::{InvocationCorrelator, PendingInvocation, DEFAULT_OPERATION_TIMEOUT};
pub use protocol::*;
pub use transport::{FramedTransport, MessageSender};
