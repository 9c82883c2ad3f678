//! Session lifecycle for the remote-debugging transport.
//!
//! Provides:
//! - `ConsoleMonitor` - Capture one page's console output into the log buffer
//! - Page discovery by worker count with hysteresis
//! - `ConnectionManager` - Health checks, reconnects and monitor restarts
//! - In-memory transport mocks (feature: testing)

pub mod discovery;
pub mod manager;
pub mod monitor;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use discovery::{PageCandidate, Selection};
pub use manager::{ConnectionManager, ConnectionState, ConnectionStatus, SessionHandle};
pub use monitor::{ConsoleMonitor, SourceClassifier};
