//! Registry of agents connected to this server.
//!
//! Each accepted connection gets a channel id. A CONNECT handshake binds an
//! [`AgentSession`] to that channel; the entry lives until the connection
//! closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use serde::Serialize;

pub type ChannelId = u64;

/// Per-connection facts the invoker needs to answer an invocation.
#[derive(Debug, Clone, Copy)]
pub struct ChannelContext {
    pub channel_id: ChannelId,
    pub peer: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSession {
    pub session_id: String,
    pub host: String,
    pub agent_id: String,
    pub peer: SocketAddr,
    /// Epoch milliseconds of the handshake.
    pub connected_at: u64,
}

pub struct SessionRegistry {
    route: String,
    sessions: Mutex<HashMap<ChannelId, AgentSession>>,
}

impl SessionRegistry {
    pub fn new(route: impl Into<String>) -> Self {
        SessionRegistry {
            route: route.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ChannelId, AgentSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Binds a session to the channel, returning its id and whether it is new.
    ///
    /// A second CONNECT on the same channel returns the existing session
    /// unchanged.
    pub fn register(
        &self,
        channel: ChannelContext,
        host: impl Into<String>,
        agent_id: impl Into<String>,
    ) -> (String, bool) {
        let mut sessions = self.sessions();
        if let Some(existing) = sessions.get(&channel.channel_id) {
            return (existing.session_id.clone(), false);
        }
        let session = AgentSession {
            session_id: format!("{}:{}", self.route, channel.channel_id),
            host: host.into(),
            agent_id: agent_id.into(),
            peer: channel.peer,
            connected_at: epoch_millis(),
        };
        let session_id = session.session_id.clone();
        sessions.insert(channel.channel_id, session);
        (session_id, true)
    }

    pub fn remove(&self, channel_id: ChannelId) -> Option<AgentSession> {
        self.sessions().remove(&channel_id)
    }

    pub fn get(&self, channel_id: ChannelId) -> Option<AgentSession> {
        self.sessions().get(&channel_id).cloned()
    }

    /// Snapshot of every live session, ordered by session id.
    pub fn sessions_snapshot(&self) -> Vec<AgentSession> {
        let mut sessions: Vec<_> = self.sessions().values().cloned().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: ChannelId) -> ChannelContext {
        ChannelContext {
            channel_id: id,
            peer: "127.0.0.1:50000".parse().unwrap(),
        }
    }

    #[test]
    fn test_session_id_uses_route_and_channel() {
        let registry = SessionRegistry::new("collector");
        let (id, new) = registry.register(channel(7), "hostA", "agentX");
        assert_eq!(id, "collector:7");
        assert!(new);
        assert_eq!(registry.get(7).unwrap().host, "hostA");
    }

    #[test]
    fn test_reconnect_on_same_channel_keeps_session() {
        let registry = SessionRegistry::new("collector");
        let (first, _) = registry.register(channel(1), "hostA", "agentX");
        let (second, new) = registry.register(channel(1), "hostB", "agentY");
        assert_eq!(first, second);
        assert!(!new);
        assert_eq!(registry.get(1).unwrap().agent_id, "agentX");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_and_snapshot() {
        let registry = SessionRegistry::new("r");
        registry.register(channel(2), "h2", "a2");
        registry.register(channel(1), "h1", "a1");

        let ids: Vec<_> = registry.sessions_snapshot().into_iter().map(|s| s.session_id).collect();
        assert_eq!(ids, vec!["r:1", "r:2"]);

        assert!(registry.remove(1).is_some());
        assert!(registry.remove(1).is_none());
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }
}
