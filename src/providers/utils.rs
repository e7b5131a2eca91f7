use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::errors::ProviderError;

lazy_static! {
    static ref INVALID_NAME_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
    static ref VALID_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

pub fn sanitize_function_name(name: &str) -> String {
    INVALID_NAME_CHARS.replace_all(name, "_").to_string()
}

pub fn is_valid_function_name(name: &str) -> bool {
    VALID_NAME.is_match(name)
}

/// Decode a tool-call `arguments` value. Backends send either a JSON object
/// or a JSON-encoded string; decode failures degrade to `{"raw": original}`
/// rather than failing the whole parse.
pub fn decode_arguments(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            _ => {
                let mut map = Map::new();
                map.insert("raw".to_string(), json!(raw));
                map
            }
        },
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("raw".to_string(), other.clone());
            map
        }
    }
}

/// Best-effort tool-name inference from the argument key set, for models that
/// emit tool intent without naming the tool. Heuristic only; it can
/// misclassify and must never be treated as authoritative.
pub fn infer_tool_name(arguments: &Map<String, Value>) -> Option<&'static str> {
    if arguments.contains_key("action") || arguments.contains_key("coordinate") {
        return Some("computer");
    }
    if arguments.contains_key("path") && arguments.contains_key("command") {
        return Some("str_replace_editor");
    }
    if arguments.contains_key("command") {
        return Some("bash");
    }
    None
}

/// A tool call recovered from plain text content.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredToolCall {
    pub tool_name: Option<String>,
    pub arguments: Map<String, Value>,
}

/// Attempt to parse raw assistant text as a JSON object (or array of objects)
/// whose shape resembles a function call. Smaller and local models are known
/// to emit tool intent this way instead of using the structured field.
pub fn recover_embedded_tool_calls(text: &str) -> Vec<RecoveredToolCall> {
    let parsed: Value = match serde_json::from_str(text.trim()) {
        Ok(value) => value,
        Err(_) => return Vec::new(),
    };
    let candidates: Vec<&Value> = match &parsed {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![&parsed],
        _ => return Vec::new(),
    };

    let mut calls = Vec::new();
    for candidate in candidates {
        let object = match candidate.as_object() {
            Some(object) => object,
            None => continue,
        };
        let looks_like_call = object.contains_key("type")
            || object.contains_key("name")
            || object.contains_key("tool_name")
            || object.contains_key("arguments")
            || object.contains_key("parameters");
        if !looks_like_call {
            continue;
        }

        let tool_name = object
            .get("name")
            .or_else(|| object.get("tool_name"))
            .and_then(Value::as_str)
            .map(String::from);
        let arguments = object
            .get("arguments")
            .or_else(|| object.get("parameters"))
            .map(decode_arguments)
            .unwrap_or_default();

        if tool_name.is_none() && arguments.is_empty() {
            continue;
        }
        calls.push(RecoveredToolCall { tool_name, arguments });
    }
    calls
}

/// Surface the OpenAI-style context-length error code as a distinct failure.
pub fn check_context_length_error(error: &Value) -> Option<ProviderError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Unknown error")
            .to_string();
        Some(ProviderError::ContextLengthExceeded(message))
    } else {
        None
    }
}
