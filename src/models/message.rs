use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::content::ImageSource;
use super::role::Role;

/// Annotation key used to mark a segment as a prompt-cache breakpoint.
/// Placement is owned by the sampling loop; adapters only pass it through.
pub const CACHE_CONTROL_KEY: &str = "cache_control";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSegment {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingSegment {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSegment {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    /// Backend-assigned id, echoed back in the matching result.
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultSegment {
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_text: Option<String>,
    #[serde(default)]
    pub images: Vec<ImageSource>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, Value>>,
}

/// One typed unit of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text(TextSegment),
    /// Backend-internal reasoning trace. Opaque pass-through, never interpreted.
    Thinking(ThinkingSegment),
    ToolCall(ToolCallSegment),
    ToolResult(ToolResultSegment),
}

impl Segment {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Segment::Text(TextSegment {
            text: text.into(),
            annotations: None,
        })
    }

    pub fn thinking<S: Into<String>>(content: S, signature: Option<String>) -> Self {
        Segment::Thinking(ThinkingSegment {
            content: content.into(),
            signature,
        })
    }

    pub fn tool_call<N, I>(tool_name: N, arguments: Map<String, Value>, call_id: I) -> Self
    where
        N: Into<String>,
        I: Into<String>,
    {
        Segment::ToolCall(ToolCallSegment {
            tool_name: tool_name.into(),
            arguments,
            call_id: call_id.into(),
        })
    }

    pub fn tool_result(segment: ToolResultSegment) -> Self {
        Segment::ToolResult(segment)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Segment::Text(text) => Some(&text.text),
            _ => None,
        }
    }

    pub fn as_tool_call(&self) -> Option<&ToolCallSegment> {
        match self {
            Segment::ToolCall(call) => Some(call),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResultSegment> {
        match self {
            Segment::ToolResult(result) => Some(result),
            _ => None,
        }
    }

    /// Mark or unmark this segment as a cache breakpoint. Only text and
    /// tool-result segments can carry the marker; other kinds ignore it.
    pub fn set_cache_control(&mut self, enabled: bool) {
        let annotations = match self {
            Segment::Text(text) => &mut text.annotations,
            Segment::ToolResult(result) => &mut result.annotations,
            _ => return,
        };
        if enabled {
            annotations
                .get_or_insert_with(HashMap::new)
                .insert(CACHE_CONTROL_KEY.to_string(), json!({"type": "ephemeral"}));
        } else if let Some(map) = annotations {
            map.remove(CACHE_CONTROL_KEY);
            if map.is_empty() {
                *annotations = None;
            }
        }
    }

    pub fn cache_control(&self) -> Option<&Value> {
        let annotations = match self {
            Segment::Text(text) => text.annotations.as_ref(),
            Segment::ToolResult(result) => result.annotations.as_ref(),
            _ => None,
        };
        annotations.and_then(|map| map.get(CACHE_CONTROL_KEY))
    }
}

/// A message to or from the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub created: i64,
    pub segments: Vec<Segment>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn new(role: Role) -> Self {
        Message {
            role,
            created: Utc::now().timestamp(),
            segments: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn user() -> Self {
        Message::new(Role::User)
    }

    pub fn assistant() -> Self {
        Message::new(Role::Assistant)
    }

    pub fn with_segment(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.with_segment(Segment::text(text))
    }

    pub fn with_thinking<S: Into<String>>(self, content: S, signature: Option<String>) -> Self {
        self.with_segment(Segment::thinking(content, signature))
    }

    pub fn with_tool_call<N, I>(self, tool_name: N, arguments: Map<String, Value>, call_id: I) -> Self
    where
        N: Into<String>,
        I: Into<String>,
    {
        self.with_segment(Segment::tool_call(tool_name, arguments, call_id))
    }

    pub fn with_tool_result(self, result: ToolResultSegment) -> Self {
        self.with_segment(Segment::ToolResult(result))
    }

    /// Iterator over the tool calls in this message, in segment order.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallSegment> {
        self.segments.iter().filter_map(Segment::as_tool_call)
    }

    /// Concatenated text content of the message.
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .filter_map(Segment::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Token usage reported by the backend, zero when unreported.
    pub fn usage(&self) -> (u64, u64) {
        let usage = self.metadata.get("usage");
        let field = |name: &str| {
            usage
                .and_then(|u| u.get(name))
                .and_then(Value::as_u64)
                .unwrap_or(0)
        };
        (field("input_tokens"), field("output_tokens"))
    }

    pub fn record_usage(&mut self, input_tokens: u64, output_tokens: u64) {
        self.metadata.insert(
            "usage".to_string(),
            json!({"input_tokens": input_tokens, "output_tokens": output_tokens}),
        );
    }
}

/// The full ordered conversation state for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_prompts: Vec<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.system_prompts.push(prompt.into());
        self
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Check that every tool result is paired with exactly one preceding
    /// assistant tool call. Adapters reject violating transcripts instead of
    /// silently dropping segments.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen_calls: HashMap<&str, usize> = HashMap::new();
        for message in &self.messages {
            for segment in &message.segments {
                match segment {
                    Segment::ToolCall(call) if message.role == Role::Assistant => {
                        *seen_calls.entry(call.call_id.as_str()).or_insert(0) += 1;
                    }
                    Segment::ToolResult(result) => {
                        match seen_calls.get(result.call_id.as_str()) {
                            Some(1) => {}
                            Some(n) => {
                                return Err(format!(
                                    "tool result '{}' matches {} tool calls",
                                    result.call_id, n
                                ));
                            }
                            None => {
                                return Err(format!(
                                    "tool result '{}' has no preceding tool call",
                                    result.call_id
                                ));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builders() {
        let mut arguments = Map::new();
        arguments.insert("command".to_string(), json!("ls"));
        let message = Message::assistant()
            .with_text("Listing files")
            .with_tool_call("bash", arguments, "call_1");

        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.segments.len(), 2);
        assert_eq!(message.text(), "Listing files");
        assert_eq!(message.tool_calls().count(), 1);
    }

    #[test]
    fn test_usage_metadata() {
        let mut message = Message::assistant().with_text("hi");
        assert_eq!(message.usage(), (0, 0));
        message.record_usage(12, 34);
        assert_eq!(message.usage(), (12, 34));
    }

    #[test]
    fn test_cache_control_marking() {
        let mut segment = Segment::text("hello");
        assert!(segment.cache_control().is_none());

        segment.set_cache_control(true);
        assert_eq!(segment.cache_control(), Some(&json!({"type": "ephemeral"})));

        segment.set_cache_control(false);
        assert!(segment.cache_control().is_none());

        // Tool calls never carry the marker.
        let mut call = Segment::tool_call("bash", Map::new(), "1");
        call.set_cache_control(true);
        assert!(call.cache_control().is_none());
    }

    #[test]
    fn test_transcript_validation() {
        let mut transcript = Transcript::new();
        transcript.push(Message::user().with_text("run ls"));
        transcript.push(Message::assistant().with_tool_call("bash", Map::new(), "call_1"));
        transcript.push(Message::user().with_tool_result(ToolResultSegment {
            call_id: "call_1".to_string(),
            output_text: Some("file.txt".to_string()),
            images: vec![],
            is_error: false,
            system_note: None,
            annotations: None,
        }));
        assert!(transcript.validate().is_ok());

        transcript.push(Message::user().with_tool_result(ToolResultSegment {
            call_id: "call_unknown".to_string(),
            output_text: None,
            images: vec![],
            is_error: false,
            system_note: None,
            annotations: None,
        }));
        let err = transcript.validate().unwrap_err();
        assert!(err.contains("call_unknown"));
    }

    #[test]
    fn test_segment_serialization_tags() {
        let value = serde_json::to_value(Segment::text("hi")).unwrap();
        assert_eq!(value["type"], "text");

        let value = serde_json::to_value(Segment::thinking("mull", None)).unwrap();
        assert_eq!(value["type"], "thinking");

        let value = serde_json::to_value(Segment::tool_call("bash", Map::new(), "1")).unwrap();
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["call_id"], "1");
    }
}
