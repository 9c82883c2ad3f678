//! Wire protocol between the bridge and the plugin UI.

use plugin_bridge_core::{BridgeError, error::is_stale_reference_message};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Run code in the plugin sandbox.
pub const EXECUTE_CODE: &str = "EXECUTE_CODE";
/// Read local variables and collections.
pub const GET_VARIABLES_DATA: &str = "GET_VARIABLES_DATA";
/// Export a node (or the current page) as an image.
pub const CAPTURE_SCREENSHOT: &str = "CAPTURE_SCREENSHOT";
/// Set a variable's value for one mode.
pub const UPDATE_VARIABLE: &str = "UPDATE_VARIABLE";

/// Unsolicited console output forwarded by the plugin.
pub const CONSOLE_CAPTURE: &str = "CONSOLE_CAPTURE";
/// Announces the document the plugin is running in.
pub const FILE_INFO: &str = "FILE_INFO";

/// Outbound command frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    pub payload: Value,
}

/// Error reported by the plugin, either bare text or with a stack.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RemoteError {
    Message(String),
    Detailed {
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
}

impl From<RemoteError> for BridgeError {
    fn from(err: RemoteError) -> Self {
        let (message, stack) = match err {
            RemoteError::Message(message) => (message, None),
            RemoteError::Detailed { message, stack } => (message, stack),
        };
        if is_stale_reference_message(&message) {
            Self::StaleReference(message)
        } else {
            Self::Execution { message, stack }
        }
    }
}

/// Inbound reply to a command.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayResponse {
    pub id: String,
    /// `Some(Value::Null)` for an explicit `"result": null`, `None` when absent.
    #[serde(default, deserialize_with = "present")]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RemoteError>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl RelayResponse {
    /// Convert into the reply delivered to the waiting caller.
    ///
    /// # Errors
    /// Returns the remote error when the frame carries one, or a protocol
    /// error when it carries neither a result nor an error.
    pub fn into_reply(self) -> Result<Value, BridgeError> {
        match (self.error, self.result) {
            (Some(err), _) => Err(err.into()),
            (None, Some(result)) => Ok(result),
            (None, None) => Err(BridgeError::Protocol(format!(
                "reply {} carries neither result nor error",
                self.id
            ))),
        }
    }
}

/// Inbound event not tied to any command.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// Any frame the plugin may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundFrame {
    Response(RelayResponse),
    Event(RelayEvent),
}

impl InboundFrame {
    /// Parse a text frame.
    ///
    /// # Errors
    /// Returns a protocol error for frames that are neither a response nor an
    /// event.
    pub fn parse(text: &str) -> Result<Self, BridgeError> {
        serde_json::from_str(text)
            .map_err(|e| BridgeError::Protocol(format!("malformed relay frame: {e}")))
    }
}

/// Best-effort correlation id of a frame that failed to parse.
///
/// Numeric ids are rendered as text so they can still be matched.
#[must_use]
pub fn salvage_id(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    match value.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Payload of a [`CONSOLE_CAPTURE`] event.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleCapture {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

fn default_level() -> String {
    "log".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req = RelayRequest {
            id: "r1".into(),
            command_type: EXECUTE_CODE.into(),
            payload: serde_json::json!({"code": "return 1"}),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "EXECUTE_CODE");
        assert_eq!(json["payload"]["code"], "return 1");
    }

    #[test]
    fn test_response_frames() {
        let ok = InboundFrame::parse(r#"{"id":"a","result":{"n":1}}"#).unwrap();
        let InboundFrame::Response(ok) = ok else {
            panic!("expected response");
        };
        assert_eq!(ok.into_reply().unwrap()["n"], 1);

        let err = InboundFrame::parse(r#"{"id":"b","error":"boom"}"#).unwrap();
        let InboundFrame::Response(err) = err else {
            panic!("expected response");
        };
        assert!(matches!(
            err.into_reply(),
            Err(BridgeError::Execution { ref message, .. }) if message == "boom"
        ));
    }

    #[test]
    fn test_detailed_error_keeps_stack() {
        let frame = r#"{"id":"c","error":{"message":"bad","stack":"at line 1"}}"#;
        let InboundFrame::Response(resp) = InboundFrame::parse(frame).unwrap() else {
            panic!("expected response");
        };
        match resp.into_reply() {
            Err(BridgeError::Execution { stack, .. }) => {
                assert_eq!(stack.as_deref(), Some("at line 1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_event_frames() {
        let frame = r#"{"type":"CONSOLE_CAPTURE","payload":{"level":"warn","args":["x"]}}"#;
        let InboundFrame::Event(event) = InboundFrame::parse(frame).unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.event_type, CONSOLE_CAPTURE);
        let capture: ConsoleCapture = serde_json::from_value(event.payload).unwrap();
        assert_eq!(capture.level, "warn");
    }

    #[test]
    fn test_explicit_null_result_is_a_value() {
        let InboundFrame::Response(resp) =
            InboundFrame::parse(r#"{"id":"d","result":null}"#).unwrap()
        else {
            panic!("expected response");
        };
        assert_eq!(resp.into_reply().unwrap(), Value::Null);
    }

    #[test]
    fn test_reply_without_result_or_error_is_protocol_error() {
        let InboundFrame::Response(resp) = InboundFrame::parse(r#"{"id":"e"}"#).unwrap() else {
            panic!("expected response");
        };
        assert!(matches!(resp.into_reply(), Err(BridgeError::Protocol(_))));
    }

    #[test]
    fn test_salvage_id_from_unparseable_reply() {
        let bad_error = r#"{"id":"f","error":{"code":5}}"#;
        assert!(InboundFrame::parse(bad_error).is_err());
        assert_eq!(salvage_id(bad_error).as_deref(), Some("f"));
        assert_eq!(salvage_id(r#"{"id":7,"result":1}"#).as_deref(), Some("7"));
        assert_eq!(salvage_id(r#"{"result":1}"#), None);
        assert_eq!(salvage_id("not json"), None);
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        assert!(matches!(
            InboundFrame::parse("[1,2]"),
            Err(BridgeError::Protocol(_))
        ));
    }
}
