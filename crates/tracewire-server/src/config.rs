use std::time::Duration;

use tracewire_common::config::{env_millis, env_or, env_string};
use tracewire_common::transport::DEFAULT_OUTBOUND_CAPACITY;
use tracewire_trace::AccumulatorConfig;

/// Server listener and pipeline settings.
///
/// # Default Configuration
///
/// - `bind_addr`: `0.0.0.0:9428`
/// - `route`: `tracewire`
/// - `flush_size`: 200 traces
/// - `flush_interval`: 5000 ms
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Prefix of every session id handed out by this server.
    pub route: String,
    pub outbound_capacity: usize,
    pub flush_size: usize,
    pub flush_interval: Duration,
    /// Deliver each batch to the endpoints in parallel rather than in order.
    pub multithreaded: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9428".to_string(),
            route: "tracewire".to_string(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            flush_size: 200,
            flush_interval: Duration::from_millis(5000),
            multithreaded: false,
        }
    }
}

impl ServerConfig {
    /// Applies `TRACEWIRE_BIND`, `TRACEWIRE_ROUTE`, `TRACEWIRE_FLUSH_SIZE`,
    /// `TRACEWIRE_FLUSH_INTERVAL_MS` and `TRACEWIRE_MULTITHREADED` over the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_string("BIND").unwrap_or(defaults.bind_addr),
            route: env_string("ROUTE").unwrap_or(defaults.route),
            flush_size: env_or("FLUSH_SIZE", defaults.flush_size),
            flush_interval: env_millis("FLUSH_INTERVAL_MS", defaults.flush_interval),
            multithreaded: env_or("MULTITHREADED", defaults.multithreaded),
            ..defaults
        }
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn accumulator_config(&self) -> AccumulatorConfig {
        AccumulatorConfig {
            flush_size: self.flush_size,
            flush_interval: self.flush_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.route, "tracewire");
        assert_eq!(config.accumulator_config().flush_size, 200);
        assert_eq!(config.accumulator_config().flush_interval, Duration::from_millis(5000));
    }
}
