use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Debug;

/// Broad category of a capability, used by argument-shape inference for
/// backends that emit tool intent without a tool name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    ComputerUse,
    Bash,
    Edit,
    Generic,
}

impl Default for ToolType {
    fn default() -> Self {
        ToolType::Generic
    }
}

/// A capability advertisement, independent of any backend.
///
/// `metadata` carries backend-native schema representations keyed by provider
/// (for Anthropic-style backends, the full tool param under
/// `"anthropic_params"`); adapters fall back to a generic function schema when
/// their key is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(default)]
    pub tool_type: ToolType,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ToolSpec {
    pub fn new<N, D>(name: N, description: D, input_schema: Value) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        ToolSpec {
            name: name.into(),
            description: description.into(),
            input_schema,
            tool_type: ToolType::Generic,
            metadata: Map::new(),
        }
    }

    pub fn with_tool_type(mut self, tool_type: ToolType) -> Self {
        self.tool_type = tool_type;
        self
    }

    pub fn with_metadata<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_builder() {
        let spec = ToolSpec::new(
            "bash",
            "Run a shell command",
            json!({"type": "object", "properties": {"command": {"type": "string"}}}),
        )
        .with_tool_type(ToolType::Bash)
        .with_metadata("anthropic_params", json!({"type": "bash_20250124", "name": "bash"}));

        assert_eq!(spec.name, "bash");
        assert_eq!(spec.tool_type, ToolType::Bash);
        assert!(spec.metadata.contains_key("anthropic_params"));
    }

    #[test]
    fn test_default_tool_type() {
        let spec: ToolSpec = serde_json::from_value(json!({
            "name": "echo",
            "description": "Echo input",
            "input_schema": {"type": "object"}
        }))
        .unwrap();
        assert_eq!(spec.tool_type, ToolType::Generic);
    }
}
