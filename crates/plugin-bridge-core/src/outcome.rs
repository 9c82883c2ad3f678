//! Results returned by the execution bridge.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;

/// Which transport served a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    RemoteDebugging,
    MessageRelay,
}

/// Shape of a structurally valid but suspiciously empty result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptinessKind {
    Null,
    EmptyArray,
    EmptyObject,
    AllFieldsEmpty,
}

/// Advisory attached to an otherwise successful result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Advisory {
    pub kind: EmptinessKind,
    pub message: String,
}

/// Successful result of a bridge operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advisory: Option<Advisory>,
    pub transport: TransportKind,
    pub elapsed_ms: u64,
}

impl ExecutionOutcome {
    /// Wrap a value, attaching an emptiness advisory when warranted.
    #[must_use]
    pub fn new(value: Value, transport: TransportKind, elapsed: std::time::Duration) -> Self {
        let advisory = detect_suspicious_emptiness(&value);
        Self {
            value,
            advisory,
            transport,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Flag null, `[]`, `{}`, or an object whose every field is empty.
///
/// These are valid results, but usually mean the code queried the wrong
/// page, node, or scope.
#[must_use]
pub fn detect_suspicious_emptiness(value: &Value) -> Option<Advisory> {
    let (kind, message) = match value {
        Value::Null => (
            EmptinessKind::Null,
            "Result is null. If content was expected, make sure the code returns a value \
             and runs against the intended document.",
        ),
        Value::Array(items) if items.is_empty() => (
            EmptinessKind::EmptyArray,
            "Result is an empty array. If content was expected, check that the query \
             targets the current page or selection.",
        ),
        Value::Object(map) if map.is_empty() => (
            EmptinessKind::EmptyObject,
            "Result is an empty object. If content was expected, check the scope the \
             code ran in.",
        ),
        Value::Object(map) if map.values().all(is_empty_value) => (
            EmptinessKind::AllFieldsEmpty,
            "Every field in the result is empty. If content was expected, check that \
             the right file is open in the design application.",
        ),
        _ => return None,
    };
    Some(Advisory {
        kind,
        message: message.to_string(),
    })
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Screenshot image format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
}

impl ImageFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }
}

/// Screenshot parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotRequest {
    /// Node to export; the relay transport renders it, the debugging transport
    /// captures the viewport.
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub format: ImageFormat,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

const fn default_scale() -> f64 {
    1.0
}

impl Default for ScreenshotRequest {
    fn default() -> Self {
        Self {
            node_id: None,
            format: ImageFormat::Png,
            scale: default_scale(),
        }
    }
}

/// Decoded screenshot.
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub format: ImageFormat,
    pub bytes: Vec<u8>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Screenshot {
    /// Decode base64 image data.
    ///
    /// # Errors
    /// Returns a protocol error if the data is not valid base64.
    pub fn from_base64(format: ImageFormat, data: &str) -> Result<Self, BridgeError> {
        let bytes = BASE64
            .decode(data)
            .map_err(|e| BridgeError::Protocol(format!("invalid screenshot data: {e}")))?;
        Ok(Self {
            format,
            bytes,
            width: None,
            height: None,
        })
    }

    #[must_use]
    pub const fn with_size(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Re-encode for JSON transport.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_emptiness_shapes() {
        let kind = |v: Value| detect_suspicious_emptiness(&v).map(|a| a.kind);
        assert_eq!(kind(json!(null)), Some(EmptinessKind::Null));
        assert_eq!(kind(json!([])), Some(EmptinessKind::EmptyArray));
        assert_eq!(kind(json!({})), Some(EmptinessKind::EmptyObject));
        assert_eq!(
            kind(json!({"variables": [], "collections": []})),
            Some(EmptinessKind::AllFieldsEmpty)
        );
    }

    #[test]
    fn test_content_is_not_flagged() {
        assert!(detect_suspicious_emptiness(&json!([1])).is_none());
        assert!(detect_suspicious_emptiness(&json!({"a": [], "b": 0})).is_none());
        assert!(detect_suspicious_emptiness(&json!(0)).is_none());
        assert!(detect_suspicious_emptiness(&json!("")).is_none());
    }

    #[test]
    fn test_outcome_attaches_advisory() {
        let outcome = ExecutionOutcome::new(
            json!([]),
            TransportKind::MessageRelay,
            std::time::Duration::from_millis(3),
        );
        assert_eq!(outcome.elapsed_ms, 3);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["advisory"]["kind"], "empty_array");
        assert_eq!(json["transport"], "message_relay");
    }

    #[test]
    fn test_screenshot_decodes_base64() {
        let shot = Screenshot::from_base64(ImageFormat::Png, "iVBORw==").unwrap();
        assert_eq!(shot.bytes, [0x89, b'P', b'N', b'G']);
        assert!(Screenshot::from_base64(ImageFormat::Png, "***").is_err());
    }
}
