use std::time::Duration;

use tracewire_common::config::{env_millis, env_or, env_string};
use tracewire_common::transport::DEFAULT_OUTBOUND_CAPACITY;
use tracewire_common::DEFAULT_OPERATION_TIMEOUT;

/// Agent connection and tracing settings.
///
/// # Default Configuration
///
/// - `server_addr`: `127.0.0.1:9428`
/// - `connect_timeout`: 3000 ms
/// - `operation_timeout`: 3000 ms
/// - `flush_size`: 200 traces
/// - `flush_interval`: 5000 ms
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_addr: String,
    /// Host name reported in the CONNECT handshake and used as the metric-name root.
    pub host: String,
    pub agent_id: String,
    pub connect_timeout: Duration,
    /// Timeout for synchronous operations (CONNECT, PING).
    pub operation_timeout: Duration,
    /// How often expired pending invocations are swept.
    pub sweep_interval: Duration,
    pub outbound_capacity: usize,
    pub flush_size: usize,
    pub flush_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:9428".to_string(),
            host: default_host(),
            agent_id: "tracewire-agent".to_string(),
            connect_timeout: Duration::from_millis(3000),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            sweep_interval: Duration::from_millis(500),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            flush_size: 200,
            flush_interval: Duration::from_millis(5000),
        }
    }
}

impl AgentConfig {
    /// Applies `TRACEWIRE_SERVER`, `TRACEWIRE_HOST`, `TRACEWIRE_AGENT_ID`,
    /// `TRACEWIRE_CONNECT_TIMEOUT_MS`, `TRACEWIRE_OPERATION_TIMEOUT_MS`,
    /// `TRACEWIRE_FLUSH_SIZE` and `TRACEWIRE_FLUSH_INTERVAL_MS` over the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_addr: env_string("SERVER").unwrap_or(defaults.server_addr),
            host: env_string("HOST").unwrap_or(defaults.host),
            agent_id: env_string("AGENT_ID").unwrap_or(defaults.agent_id),
            connect_timeout: env_millis("CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            operation_timeout: env_millis("OPERATION_TIMEOUT_MS", defaults.operation_timeout),
            flush_size: env_or("FLUSH_SIZE", defaults.flush_size),
            flush_interval: env_millis("FLUSH_INTERVAL_MS", defaults.flush_interval),
            ..defaults
        }
    }

    pub fn with_server(mut self, addr: impl Into<String>) -> Self {
        self.server_addr = addr.into();
        self
    }

    pub fn with_identity(mut self, host: impl Into<String>, agent_id: impl Into<String>) -> Self {
        self.host = host.into();
        self.agent_id = agent_id.into();
        self
    }
}

fn default_host() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
