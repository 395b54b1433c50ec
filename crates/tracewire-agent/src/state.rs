use std::fmt;

/// Lifecycle of the agent's control channel.
///
/// `Disconnected → Connecting → Handshaking → Connected { session_id }`, and
/// back to `Disconnected` whenever the transport closes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// TCP connect in progress.
    Connecting,
    /// Transport up, CONNECT invocation outstanding.
    Handshaking,
    Connected { session_id: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            ConnectionState::Connected { session_id } => Some(session_id),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Handshaking => f.write_str("handshaking"),
            ConnectionState::Connected { session_id } => write!(f, "connected ({})", session_id),
        }
    }
}
