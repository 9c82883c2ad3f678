//! Bounding of captured console arguments.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Limits applied to every logged argument before it is buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncationLimits {
    /// Maximum characters kept per string.
    pub max_string_length: usize,
    /// Maximum elements kept per array.
    pub max_array_length: usize,
    /// Nesting depth past which objects and arrays are summarised.
    pub max_object_depth: usize,
}

impl Default for TruncationLimits {
    fn default() -> Self {
        Self {
            max_string_length: 500,
            max_array_length: 1000,
            max_object_depth: 10,
        }
    }
}

impl TruncationLimits {
    /// Return a bounded copy of `value`.
    #[must_use]
    pub fn apply(&self, value: &Value) -> Value {
        self.bound(value, 0)
    }

    /// Bound a plain string to `max_string_length` characters.
    #[must_use]
    pub fn apply_str(&self, s: &str) -> String {
        let total = s.chars().count();
        if total <= self.max_string_length {
            return s.to_string();
        }
        let kept: String = s.chars().take(self.max_string_length).collect();
        format!("{kept}... [{} more chars]", total - self.max_string_length)
    }

    fn bound(&self, value: &Value, depth: usize) -> Value {
        match value {
            Value::String(s) => Value::String(self.apply_str(s)),
            Value::Array(items) => {
                if depth >= self.max_object_depth {
                    return Value::String(format!("[Array({})]", items.len()));
                }
                let mut out: Vec<Value> = items
                    .iter()
                    .take(self.max_array_length)
                    .map(|v| self.bound(v, depth + 1))
                    .collect();
                if items.len() > self.max_array_length {
                    out.push(Value::String(format!(
                        "... [{} more items]",
                        items.len() - self.max_array_length
                    )));
                }
                Value::Array(out)
            }
            Value::Object(map) => {
                if depth >= self.max_object_depth {
                    return Value::String("[Object]".to_string());
                }
                let out: Map<String, Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), self.bound(v, depth + 1)))
                    .collect();
                Value::Object(out)
            }
            other => other.clone(),
        }
    }
}
