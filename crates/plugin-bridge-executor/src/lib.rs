//! Remote execution bridge.
//!
//! Provides:
//! - `CdpBridge` - Direct evaluation over the remote-debugging transport
//! - `RelayBridge` - Command round-trips over the message relay
//! - `AutoBridge` - Prefers the relay while a plugin is connected
//! - Single reconnect-and-retry policy shared by both

pub mod auto;
pub mod cdp;
pub mod relay;
pub mod retry;
pub mod scripts;

pub use auto::AutoBridge;
pub use cdp::CdpBridge;
pub use relay::RelayBridge;
pub use retry::with_single_retry;
