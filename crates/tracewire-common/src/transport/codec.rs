use crate::protocol::error::Result;
use crate::protocol::ProtocolMessage;

/// Codec for encoding/decoding control channel messages
///
/// Currently only JSON is supported, but the enum allows for future
/// extensibility (e.g., MessagePack, CBOR, etc.).
///
/// # Example
///
/// ```
/// use tracewire_common::transport::Codec;
/// use tracewire_common::protocol::{OpCode, ProtocolInvocation, ProtocolMessage};
/// use serde_json::json;
///
/// let codec = Codec::new();
/// let message = ProtocolMessage::from(ProtocolInvocation::new(OpCode::Ping, json!("PING")));
///
/// let encoded = codec.encode(&message).unwrap();
/// let decoded = codec.decode(&encoded).unwrap();
/// assert_eq!(message, decoded);
/// ```
pub enum Codec {
    /// JSON codec (currently the only supported format)
    Json(JsonCodec),
}

impl Codec {
    /// Create a new codec (JSON is the only supported format)
    pub fn new() -> Self {
        Codec::Json(JsonCodec)
    }

    /// Encode a message to bytes
    pub fn encode(&self, message: &ProtocolMessage) -> Result<Vec<u8>> {
        match self {
            Codec::Json(_) => JsonCodec::encode(message),
        }
    }

    /// Decode a message from bytes
    pub fn decode(&self, data: &[u8]) -> Result<ProtocolMessage> {
        match self {
            Codec::Json(_) => JsonCodec::decode(data),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON codec for control channel messages
///
/// Payloads are `serde_json::Value`s, so JSON keeps them opaque end to end.
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode(message: &ProtocolMessage) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(message)?)
    }

    pub fn decode(data: &[u8]) -> Result<ProtocolMessage> {
        Ok(serde_json::from_slice(data)?)
    }
}
