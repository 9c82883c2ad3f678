//! Error taxonomy shared by both transports.

use serde::Serialize;
use thiserror::Error;

/// Remote error fragments that mean the execution context we were talking to
/// no longer exists.
const STALE_MARKERS: &[&str] = &[
    "execution context was destroyed",
    "cannot find context with specified id",
    "target closed",
    "session closed",
    "session with given id not found",
    "no target with given id",
    "detached frame",
    "inspected target navigated or closed",
];

/// Bridge error.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Transport unreachable, refused, or dropped.
    #[error("Connection error: {0}")]
    Connection(String),
    /// Operation against a destroyed execution context or a revoked session.
    #[error("Stale reference: {0}")]
    StaleReference(String),
    /// Deadline exceeded.
    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },
    /// Malformed or unexpected response shape.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// The remote code itself threw.
    #[error("Execution error: {message}")]
    Execution {
        message: String,
        stack: Option<String>,
    },
}

/// Error category, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    StaleReference,
    Timeout,
    Protocol,
    Execution,
}

/// What an automated caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    Reconnect,
    VerifyBridgeRunning,
    RetryWithLongerTimeout,
    CheckVersions,
    FixCode,
}

/// Structured remediation hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Remediation {
    pub action: RemediationAction,
    pub hint: &'static str,
}

/// Serializable error payload for tool callers.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    pub action: RemediationAction,
    pub hint: &'static str,
    pub retriable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl BridgeError {
    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            stack: None,
        }
    }

    /// Classify an error message reported by the remote side.
    ///
    /// Messages naming a destroyed context become [`BridgeError::StaleReference`];
    /// anything else is a protocol-level failure.
    pub fn from_remote_message(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_stale_reference_message(&message) {
            Self::StaleReference(message)
        } else {
            Self::Protocol(message)
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::StaleReference(_) => ErrorKind::StaleReference,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Execution { .. } => ErrorKind::Execution,
        }
    }

    /// Whether one forced reconnect plus retry may fix this.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::StaleReference(_))
    }

    #[must_use]
    pub const fn remediation(&self) -> Remediation {
        match self {
            Self::Connection(_) => Remediation {
                action: RemediationAction::VerifyBridgeRunning,
                hint: "Verify the design application is running with remote debugging enabled, \
                       or that the bridge plugin is open and connected.",
            },
            Self::StaleReference(_) => Remediation {
                action: RemediationAction::Reconnect,
                hint: "The execution context was replaced (reload, navigation or sleep/wake). \
                       Reconnect and retry the operation.",
            },
            Self::Timeout { .. } => Remediation {
                action: RemediationAction::RetryWithLongerTimeout,
                hint: "The operation exceeded its deadline. Check the plugin is responsive \
                       and retry with a longer timeout.",
            },
            Self::Protocol(_) => Remediation {
                action: RemediationAction::CheckVersions,
                hint: "Unexpected response shape. Check that the bridge plugin and server \
                       versions match.",
            },
            Self::Execution { .. } => Remediation {
                action: RemediationAction::FixCode,
                hint: "The code threw inside the plugin runtime. Inspect the message and \
                       fix the code before retrying.",
            },
        }
    }

    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        let remediation = self.remediation();
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
            action: remediation.action,
            hint: remediation.hint,
            retriable: self.is_recoverable() || matches!(self, Self::Timeout { .. }),
            stack: match self {
                Self::Execution { stack, .. } => stack.clone(),
                _ => None,
            },
        }
    }
}

/// Whether a remote error message names a destroyed execution context.
#[must_use]
pub fn is_stale_reference_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    STALE_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_messages_are_classified() {
        let err = BridgeError::from_remote_message("Execution context was destroyed.");
        assert_eq!(err.kind(), ErrorKind::StaleReference);
        assert!(err.is_recoverable());

        let err = BridgeError::from_remote_message("Invalid parameters");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_timeout_message_carries_operation() {
        let err = BridgeError::timeout("EXECUTE_CODE", std::time::Duration::from_millis(1500));
        assert_eq!(err.to_string(), "EXECUTE_CODE timed out after 1500ms");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_payload_has_remediation() {
        let payload = BridgeError::StaleReference("gone".into()).to_payload();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "stale_reference");
        assert_eq!(json["action"], "reconnect");
        assert_eq!(json["retriable"], true);

        let payload = BridgeError::Protocol("bad".into()).to_payload();
        assert!(!payload.retriable);
        assert_eq!(payload.action, RemediationAction::CheckVersions);
    }
}
