//! TraceWire
//!
//! Umbrella crate re-exporting the workspace members so the cross-crate
//! integration tests under `tests/` have a single dependency surface.

pub use tracewire_agent as agent;
pub use tracewire_common as common;
pub use tracewire_server as server;
pub use tracewire_trace as trace;
