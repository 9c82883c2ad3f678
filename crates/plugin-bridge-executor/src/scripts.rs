//! Scripts evaluated over the remote-debugging transport.
//!
//! Every script runs as an async function in the page, guarded so a page
//! without the plugin API fails with a clear message instead of a
//! `ReferenceError`.

use plugin_bridge_core::{BridgeError, DocumentMutation, VariableUpdate};
use serde_json::Value;

/// Thrown when the page has no plugin API.
pub const NO_PLUGIN_API: &str =
    "plugin API is not available in this page; open a plugin in the design application";

/// Render a value as a JavaScript literal.
fn lit(value: impl Into<Value>) -> String {
    value.into().to_string()
}

/// Wrap caller code so `return` and `await` work at the top level.
#[must_use]
pub fn wrap_code(code: &str) -> String {
    format!(
        "(async () => {{\n\
         if (typeof figma === 'undefined') {{ throw new Error({guard}); }}\n\
         {code}\n\
         }})()",
        guard = lit(NO_PLUGIN_API),
    )
}

/// Read local variable collections and variables.
#[must_use]
pub fn get_variables() -> String {
    wrap_code(
        "const collections = await figma.variables.getLocalVariableCollectionsAsync();\n\
         const variables = await figma.variables.getLocalVariablesAsync();\n\
         return {\n\
           collections: collections.map(c => ({ id: c.id, name: c.name, modes: c.modes, \
         variableIds: c.variableIds })),\n\
           variables: variables.map(v => ({ id: v.id, name: v.name, resolvedType: v.resolvedType, \
         valuesByMode: v.valuesByMode, variableCollectionId: v.variableCollectionId })),\n\
         };",
    )
}

/// Set a variable's value for one mode.
#[must_use]
pub fn update_variable(update: &VariableUpdate) -> String {
    wrap_code(&format!(
        "const variable = await figma.variables.getVariableByIdAsync({id});\n\
         if (!variable) {{ throw new Error('Variable not found: ' + {id}); }}\n\
         variable.setValueForMode({mode}, {value});\n\
         return {{ id: variable.id, name: variable.name, modeId: {mode} }};",
        id = lit(update.variable_id.as_str()),
        mode = lit(update.mode_id.as_str()),
        value = update.value,
    ))
}

/// Script applying a document mutation.
///
/// # Errors
/// Returns a protocol error for custom mutations, which only the relay
/// transport can route.
pub fn mutation(mutation: &DocumentMutation) -> Result<String, BridgeError> {
    let (node_id, body) = match mutation {
        DocumentMutation::RenameNode { node_id, name } => (
            node_id,
            format!(
                "node.name = {};\nreturn {{ id: node.id, name: node.name }};",
                lit(name.as_str())
            ),
        ),
        DocumentMutation::DeleteNode { node_id } => (
            node_id,
            "const id = node.id;\nnode.remove();\nreturn { id, deleted: true };".to_string(),
        ),
        DocumentMutation::MoveNode { node_id, x, y } => (
            node_id,
            format!(
                "node.x = {};\nnode.y = {};\nreturn {{ id: node.id, x: node.x, y: node.y }};",
                lit(*x),
                lit(*y)
            ),
        ),
        DocumentMutation::ResizeNode {
            node_id,
            width,
            height,
        } => (
            node_id,
            format!(
                "node.resize({}, {});\n\
                 return {{ id: node.id, width: node.width, height: node.height }};",
                lit(*width),
                lit(*height)
            ),
        ),
        DocumentMutation::SetTextContent { node_id, text } => (
            node_id,
            format!(
                "if (node.type !== 'TEXT') {{ throw new Error('Node is not a text node: ' + node.id); }}\n\
                 await figma.loadFontAsync(node.fontName);\n\
                 node.characters = {};\n\
                 return {{ id: node.id, characters: node.characters }};",
                lit(text.as_str())
            ),
        ),
        DocumentMutation::CloneNode { node_id } => (
            node_id,
            "const copy = node.clone();\nreturn { id: copy.id, name: copy.name };".to_string(),
        ),
        DocumentMutation::Custom { command, .. } => {
            return Err(BridgeError::Protocol(format!(
                "{command} is only available over the message relay"
            )));
        }
    };
    Ok(wrap_code(&format!(
        "const node = await figma.getNodeByIdAsync({id});\n\
         if (!node) {{ throw new Error('Node not found: ' + {id}); }}\n\
         {body}",
        id = lit(node_id.as_str()),
    )))
}
