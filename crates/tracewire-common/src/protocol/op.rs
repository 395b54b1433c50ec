//! Operation codes understood by agents and servers.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::TraceWireError;

/// An operation on the agent control channel.
///
/// Codes travel on the wire as plain integers so that a peer speaking a newer
/// protocol can still be decoded; [`OpCode::try_from`] is where an unknown code
/// becomes an explicit [`TraceWireError::UnknownOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum OpCode {
    /// Session handshake. Payload `[host, agent_id]`, response payload is the session id.
    Connect,
    /// Liveness check. The payload is echoed back.
    Ping,
    /// Trace shipment. Payload is an array of trace events; the server answers
    /// with the accepted count but nobody waits for it.
    Trace,
}

impl OpCode {
    pub const ALL: [OpCode; 3] = [OpCode::Connect, OpCode::Ping, OpCode::Trace];

    /// Wire value of this operation.
    pub fn code(self) -> i32 {
        match self {
            OpCode::Connect => 0,
            OpCode::Ping => 1,
            OpCode::Trace => 2,
        }
    }

    /// Fire-and-forget operations are never registered with a correlator.
    pub fn is_async(self) -> bool {
        matches!(self, OpCode::Trace)
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Connect => "CONNECT",
            OpCode::Ping => "PING",
            OpCode::Trace => "TRACE",
        }
    }
}

impl TryFrom<i32> for OpCode {
    type Error = TraceWireError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(OpCode::Connect),
            1 => Ok(OpCode::Ping),
            2 => Ok(OpCode::Trace),
            other => Err(TraceWireError::UnknownOperation(other)),
        }
    }
}

impl From<OpCode> for i32 {
    fn from(op: OpCode) -> Self {
        op.code()
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed value carried by PING invocations and echoed by the server.
pub const PING_PAYLOAD: &str = "PING";
