//! TraceWire Server
//!
//! This crate provides the server end of the TraceWire control channel:
//!
//! - [`TraceServer`]: TCP accept loop, one task per agent connection
//! - [`ServerInvoker`]: answers CONNECT, PING and TRACE, and fails unknown
//!   operations explicitly
//! - [`SessionRegistry`]: agents currently connected, keyed by channel
//! - [`BatchingSink`]: hands accepted traces to the batch pipeline
//!
//! [`ServerPipeline::bind`] wires all of them to a set of endpoints.

pub mod config;
pub mod invoker;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod sink;

pub use config::ServerConfig;
pub use invoker::{InvokerStats, ServerInvoker};
pub use pipeline::ServerPipeline;
pub use server::TraceServer;
pub use session::{AgentSession, ChannelContext, ChannelId, SessionRegistry};
pub use sink::{BatchingSink, TraceSink};
