//! Remote-debugging transport.
//!
//! Provides:
//! - `CdpBrowser` - Target listing and page attachment over the loopback port
//! - `CdpPage` - An attached page with worker tracking and runtime events
//! - `DebugBrowser` / `DebugPage` - Seam traits the session layer depends on

pub mod browser;
pub mod connection;
pub mod page;
pub mod target;

pub use browser::CdpBrowser;
pub use connection::{CdpConnection, CdpEvent};
pub use page::CdpPage;
pub use target::{
    ConsoleEvent, DebugBrowser, DebugPage, ExceptionEvent, RuntimeEvent, TargetInfo,
    WorkerInfo,
};
