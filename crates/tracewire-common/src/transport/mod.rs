//! TraceWire Transport Layer
//!
//! The control channel between agents and servers is an ordered, reliable
//! TCP stream carrying length-prefixed JSON frames:
//!
//! - **[`Codec`]** / **[`JsonCodec`]**: Encode/decode [`ProtocolMessage`](crate::protocol::ProtocolMessage)s
//! - **[`FramedTransport`]**: Connect, and read/write frames on any async stream half
//! - **[`MessageSender`]** / [`spawn_writer`]: One writer task per connection, many senders
//!
//! # Wire Format
//!
//! `[4-byte length prefix as u32 big-endian] + [JSON data]`, at most 100 MB per frame.

pub mod channel;
pub mod codec;
pub mod framed;

pub use channel::{spawn_writer, MessageSender, DEFAULT_OUTBOUND_CAPACITY};
pub use codec::{Codec, JsonCodec};
pub use framed::{FramedTransport, MAX_MESSAGE_SIZE};
