//! The capability interface both transports implement.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
    error::BridgeError,
    outcome::{ExecutionOutcome, Screenshot, ScreenshotRequest, TransportKind},
};

/// Identifier of one logical debugging session.
pub type SessionId = Uuid;

/// A variable value write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableUpdate {
    pub variable_id: String,
    pub mode_id: String,
    pub value: Value,
}

impl VariableUpdate {
    /// Relay payload for `UPDATE_VARIABLE`.
    #[must_use]
    pub fn payload(&self) -> Value {
        json!({
            "variableId": self.variable_id,
            "modeId": self.mode_id,
            "value": self.value,
        })
    }
}

/// A document mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DocumentMutation {
    RenameNode { node_id: String, name: String },
    DeleteNode { node_id: String },
    MoveNode { node_id: String, x: f64, y: f64 },
    ResizeNode { node_id: String, width: f64, height: f64 },
    SetTextContent { node_id: String, text: String },
    CloneNode { node_id: String },
    /// A collaborator-defined relay command, passed through untouched.
    Custom { command: String, payload: Value },
}

impl DocumentMutation {
    /// Relay command type.
    #[must_use]
    pub fn command_type(&self) -> &str {
        match self {
            Self::RenameNode { .. } => "RENAME_NODE",
            Self::DeleteNode { .. } => "DELETE_NODE",
            Self::MoveNode { .. } => "MOVE_NODE",
            Self::ResizeNode { .. } => "RESIZE_NODE",
            Self::SetTextContent { .. } => "SET_TEXT_CONTENT",
            Self::CloneNode { .. } => "CLONE_NODE",
            Self::Custom { command, .. } => command,
        }
    }

    /// Relay command payload.
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Self::RenameNode { node_id, name } => json!({ "nodeId": node_id, "newName": name }),
            Self::DeleteNode { node_id } | Self::CloneNode { node_id } => {
                json!({ "nodeId": node_id })
            }
            Self::MoveNode { node_id, x, y } => json!({ "nodeId": node_id, "x": x, "y": y }),
            Self::ResizeNode {
                node_id,
                width,
                height,
            } => json!({ "nodeId": node_id, "width": width, "height": height }),
            Self::SetTextContent { node_id, text } => json!({ "nodeId": node_id, "text": text }),
            Self::Custom { payload, .. } => payload.clone(),
        }
    }
}

/// Remote execution capabilities of the plugin runtime.
///
/// Implemented once per transport; callers depend only on this trait.
#[async_trait]
pub trait PluginBridge: Send + Sync {
    /// Transport serving this bridge.
    fn transport(&self) -> TransportKind;

    /// Run `code` inside the plugin runtime and return its result.
    async fn execute_code(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<ExecutionOutcome, BridgeError>;

    /// Read local variables and collections.
    async fn get_variables(&self) -> Result<ExecutionOutcome, BridgeError>;

    /// Write a variable value for one mode.
    async fn update_variable(
        &self,
        update: &VariableUpdate,
    ) -> Result<ExecutionOutcome, BridgeError>;

    /// Apply a document mutation.
    async fn mutate_document(
        &self,
        mutation: &DocumentMutation,
    ) -> Result<ExecutionOutcome, BridgeError>;

    /// Capture an image of the canvas or a node.
    async fn capture_screenshot(
        &self,
        request: &ScreenshotRequest,
    ) -> Result<Screenshot, BridgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_relay_mapping() {
        let m = DocumentMutation::RenameNode {
            node_id: "1:2".into(),
            name: "Header".into(),
        };
        assert_eq!(m.command_type(), "RENAME_NODE");
        assert_eq!(m.payload(), json!({"nodeId": "1:2", "newName": "Header"}));

        let m = DocumentMutation::Custom {
            command: "SET_NODE_FILLS".into(),
            payload: json!({"nodeId": "3:4"}),
        };
        assert_eq!(m.command_type(), "SET_NODE_FILLS");
        assert_eq!(m.payload()["nodeId"], "3:4");
    }

    #[test]
    fn test_mutation_deserializes_tagged() {
        let m: DocumentMutation =
            serde_json::from_str(r#"{"op":"move_node","node_id":"1:1","x":10,"y":20}"#).unwrap();
        assert_eq!(m.command_type(), "MOVE_NODE");
    }

    #[test]
    fn test_variable_update_payload() {
        let update = VariableUpdate {
            variable_id: "VariableID:1".into(),
            mode_id: "1:0".into(),
            value: json!("#fff"),
        };
        assert_eq!(update.payload()["variableId"], "VariableID:1");
    }
}
