pub mod error;
pub mod invocation;
pub mod message;
pub mod op;
pub mod response;


pub use error::{Result, TraceWireError};
pub use invocation::{Payload, ProtocolInvocation, RequestId, TIMEOUT_HEADER};
pub use message::ProtocolMessage;
pub use op::{OpCode, PING_PAYLOAD};
pub use response::ProtocolResponse;
