//! Message-relay transport.
//!
//! Provides:
//! - Wire protocol (`{id, type, payload}` out, `{id, result|error}` in)
//! - `CommandChannel` - Id-correlated request/response over a one-way socket
//! - WebSocket accept handler (feature: websocket)

pub mod channel;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use channel::{CommandChannel, FileInfo};
pub use protocol::{InboundFrame, RelayEvent, RelayRequest, RelayResponse};
