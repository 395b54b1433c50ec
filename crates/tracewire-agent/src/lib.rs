//! TraceWire Agent
//!
//! The agent side of a TraceWire control channel: an [`AgentClient`] that
//! connects and handshakes with a server, and an [`AgentTracer`] that turns
//! observations into trace events and ships them in batches.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tracewire_agent::{AgentClient, AgentConfig, AgentTracer};
//! use tracewire_trace::{DeltaManager, MetricType};
//!
//! # async fn demo() -> tracewire_common::Result<()> {
//! let client = Arc::new(AgentClient::new(AgentConfig::from_env()));
//! let session_id = client.connect().await?;
//! println!("session {}", session_id);
//!
//! let tracer = Arc::new(AgentTracer::new(client.clone(), DeltaManager::default()));
//! let _flusher = tracer.spawn_flusher();
//! tracer.trace(&["cpu"], "ticks", MetricType::DeltaLongAvg, json!(1200)).await?;
//! tracer.flush().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod state;
pub mod tracer;

#[cfg(test)]
mod test_support;

pub use client::AgentClient;
pub use config::AgentConfig;
pub use dispatcher::{CorrelatorListener, HandshakeListener, ResponseDispatcher, ResponseListener, TraceAckListener};
pub use state::ConnectionState;
pub use tracer::{AgentTracer, TracerStats};
