//! Core building blocks for the plugin bridge.
//!
//! This crate provides:
//! - `LogBuffer` - Fixed-capacity console history with live broadcast
//! - `LogEntry` - Captured console entry
//! - `BridgeError` - Error taxonomy with remediation hints
//! - `BridgeConfig` - Layered configuration
//! - `PluginBridge` - Capability trait implemented per transport

pub mod config;
pub mod error;
pub mod log_buffer;
pub mod log_entry;
pub mod outcome;
pub mod pending;
pub mod traits;
pub mod truncate;

pub use config::{BridgeConfig, ConfigError};
pub use error::{BridgeError, ErrorKind, ErrorPayload, Remediation, RemediationAction};
pub use log_buffer::{BufferStats, LevelFilter, LogBuffer, LogQuery};
pub use log_entry::{LogEntry, LogLevel, LogSource, StackFrame, StackTrace};
pub use outcome::{
    Advisory, EmptinessKind, ExecutionOutcome, ImageFormat, Screenshot, ScreenshotRequest,
    TransportKind,
};
pub use pending::PendingRequests;
pub use traits::{DocumentMutation, PluginBridge, SessionId, VariableUpdate};
pub use truncate::TruncationLimits;
