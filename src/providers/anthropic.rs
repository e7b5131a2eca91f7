use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::errors::ProviderError;
use crate::models::content::ImageSource;
use crate::models::message::{Message, Segment, ToolResultSegment, Transcript};
use crate::models::role::Role;
use crate::models::tool::ToolSpec;

use super::base::{
    post_json, ExchangeCallback, ProviderAdapter, ProviderOptions, ProviderRequest,
    ProviderResponse,
};

pub const DEFAULT_ANTHROPIC_HOST: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Adapter for backends with native typed content blocks, cache-control hints
/// and a thinking channel (Anthropic Messages API shape).
pub struct AnthropicAdapter {
    client: reqwest::Client,
    exchange_callback: Option<ExchangeCallback>,
}

impl AnthropicAdapter {
    pub fn new() -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| ProviderError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            exchange_callback: None,
        })
    }

    pub fn with_exchange_callback(mut self, callback: ExchangeCallback) -> Self {
        self.exchange_callback = Some(callback);
        self
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn prepare_request(
        &self,
        transcript: &Transcript,
        tools: &[ToolSpec],
        options: &ProviderOptions,
    ) -> Result<ProviderRequest, ProviderError> {
        transcript.validate().map_err(|violation| ProviderError::Fatal {
            status: None,
            message: format!("invalid transcript: {violation}"),
        })?;

        let api_key = options.require_extra_str("api_key")?.to_string();
        let host = options
            .extra_str("anthropic_host")
            .unwrap_or(DEFAULT_ANTHROPIC_HOST)
            .trim_end_matches('/')
            .to_string();

        let messages: Vec<Value> = transcript
            .messages
            .iter()
            .map(|message| {
                let content: Vec<Value> =
                    message.segments.iter().filter_map(segment_to_block).collect();
                json!({"role": message.role, "content": content})
            })
            .collect();

        let system_cached = options
            .extra_options
            .get("system_cache_control")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let system: Vec<Value> = transcript
            .system_prompts
            .iter()
            .map(|prompt| {
                let mut block = json!({"type": "text", "text": prompt});
                if system_cached {
                    block["cache_control"] = json!({"type": "ephemeral"});
                }
                block
            })
            .collect();

        let tool_params: Vec<Value> = tools
            .iter()
            .map(|spec| {
                spec.metadata
                    .get("anthropic_params")
                    .cloned()
                    .unwrap_or_else(|| {
                        json!({
                            "name": spec.name,
                            "description": spec.description,
                            "input_schema": spec.input_schema,
                        })
                    })
            })
            .collect();

        let mut payload = json!({
            "model": options.model,
            "max_tokens": options.max_output_tokens,
            "temperature": options.temperature,
            "messages": messages,
            "system": system,
            "tools": tool_params,
        });
        if let Some(budget) = options.thinking_budget {
            payload["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
        }
        if let Some(extra_body) = options.extra_options.get("extra_body").and_then(Value::as_object)
        {
            for (key, value) in extra_body {
                payload[key] = value.clone();
            }
        }

        let mut headers = vec![
            ("x-api-key".to_string(), api_key),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        ];
        let betas: Vec<&str> = options
            .extra_options
            .get("anthropic_betas")
            .and_then(Value::as_array)
            .map(|flags| flags.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if !betas.is_empty() {
            headers.push(("anthropic-beta".to_string(), betas.join(",")));
        }

        Ok(ProviderRequest {
            url: format!("{host}/v1/messages"),
            headers,
            payload,
            timeout: None,
        })
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        post_json(&self.client, request, self.exchange_callback.as_ref()).await
    }

    fn parse_response(&self, response: &ProviderResponse) -> Result<Message, ProviderError> {
        let content = response
            .payload
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Fatal {
                status: Some(response.status),
                message: "response missing content blocks".to_string(),
            })?;

        let mut message = Message::assistant();
        for block in content {
            if let Some(segment) = block_to_segment(block) {
                message.segments.push(segment);
            }
        }

        let usage = response.payload.get("usage");
        let tokens = |name: &str| {
            usage
                .and_then(|u| u.get(name))
                .and_then(Value::as_u64)
                .unwrap_or(0)
        };
        message.record_usage(tokens("input_tokens"), tokens("output_tokens"));
        if let Some(stop_reason) = response.payload.get("stop_reason") {
            message.metadata.insert("stop_reason".to_string(), stop_reason.clone());
        }
        Ok(message)
    }

    fn supports_thinking(&self) -> bool {
        true
    }

    fn supports_prompt_caching(&self) -> bool {
        true
    }
}

fn segment_to_block(segment: &Segment) -> Option<Value> {
    let mut block = match segment {
        Segment::Text(text) => json!({"type": "text", "text": text.text}),
        Segment::Thinking(thinking) => {
            let mut block = json!({"type": "thinking", "thinking": thinking.content});
            if let Some(signature) = &thinking.signature {
                block["signature"] = json!(signature);
            }
            block
        }
        Segment::ToolCall(call) => json!({
            "type": "tool_use",
            "id": call.call_id,
            "name": call.tool_name,
            "input": call.arguments,
        }),
        Segment::ToolResult(result) => tool_result_to_block(result),
    };
    if let Some(cache_control) = segment.cache_control() {
        block["cache_control"] = cache_control.clone();
    }
    Some(block)
}

fn tool_result_to_block(result: &ToolResultSegment) -> Value {
    let mut content: Vec<Value> = Vec::new();
    if let Some(output_text) = &result.output_text {
        let text = match &result.system_note {
            Some(note) => format!("<system>{note}</system>\n{output_text}"),
            None => output_text.clone(),
        };
        content.push(json!({"type": "text", "text": text}));
    }
    for image in &result.images {
        content.push(json!({"type": "image", "source": image_to_source(image)}));
    }
    let content: Value = if content.is_empty() {
        json!("")
    } else {
        json!(content)
    };
    json!({
        "type": "tool_result",
        "tool_use_id": result.call_id,
        "content": content,
        "is_error": result.is_error,
    })
}

fn image_to_source(image: &ImageSource) -> Value {
    match image {
        ImageSource::Base64 { media_type, data } => {
            json!({"type": "base64", "media_type": media_type, "data": data})
        }
        ImageSource::Url { url } => json!({"type": "url", "url": url}),
    }
}

fn block_to_segment(block: &Value) -> Option<Segment> {
    match block.get("type").and_then(Value::as_str)? {
        "text" => Some(Segment::text(
            block.get("text").and_then(Value::as_str).unwrap_or_default(),
        )),
        "thinking" => Some(Segment::thinking(
            block
                .get("thinking")
                .and_then(Value::as_str)
                .unwrap_or_default(),
            block
                .get("signature")
                .and_then(Value::as_str)
                .map(String::from),
        )),
        "tool_use" => {
            let arguments = block
                .get("input")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_else(Map::new);
            Some(Segment::tool_call(
                block.get("name").and_then(Value::as_str).unwrap_or_default(),
                arguments,
                block.get("id").and_then(Value::as_str).unwrap_or_default(),
            ))
        }
        "tool_result" => {
            let mut text_parts: Vec<String> = Vec::new();
            let mut images: Vec<ImageSource> = Vec::new();
            match block.get("content") {
                Some(Value::String(text)) => text_parts.push(text.clone()),
                Some(Value::Array(entries)) => {
                    for entry in entries {
                        match entry.get("type").and_then(Value::as_str) {
                            Some("text") => {
                                if let Some(text) = entry.get("text").and_then(Value::as_str) {
                                    text_parts.push(text.to_string());
                                }
                            }
                            Some("image") => {
                                if let Some(source) = entry.get("source") {
                                    if let Ok(image) =
                                        serde_json::from_value::<ImageSource>(source.clone())
                                    {
                                        images.push(image);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
            Some(Segment::ToolResult(ToolResultSegment {
                call_id: block
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                output_text: if text_parts.is_empty() {
                    None
                } else {
                    Some(text_parts.join("\n"))
                },
                images,
                is_error: block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
                system_note: None,
                annotations: None,
            }))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options_for(host: &str) -> ProviderOptions {
        ProviderOptions::new("claude-sonnet-4-20250514")
            .with_extra("api_key", json!("test_api_key"))
            .with_extra("anthropic_host", json!(host))
    }

    fn sample_transcript() -> Transcript {
        let mut transcript = Transcript::new().with_system_prompt("You are a careful operator.");
        transcript.push(Message::user().with_text("Take a screenshot"));
        transcript
    }

    #[test]
    fn test_missing_api_key_is_configuration_error() {
        let adapter = AnthropicAdapter::new().unwrap();
        let err = adapter
            .prepare_request(
                &sample_transcript(),
                &[],
                &ProviderOptions::new("claude-sonnet-4-20250514"),
            )
            .unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
    }

    #[test]
    fn test_prepare_request_shape() {
        let adapter = AnthropicAdapter::new().unwrap();
        let mut options = options_for("https://example.test");
        options.thinking_budget = Some(1024);
        options = options.with_extra("anthropic_betas", json!(["computer-use-2025-01-24"]));

        let tool = ToolSpec::new("bash", "Run a command", json!({"type": "object"}))
            .with_metadata("anthropic_params", json!({"type": "bash_20250124", "name": "bash"}));

        let request = adapter
            .prepare_request(&sample_transcript(), &[tool], &options)
            .unwrap();

        assert_eq!(request.url, "https://example.test/v1/messages");
        assert_eq!(request.payload["tools"][0]["type"], "bash_20250124");
        assert_eq!(request.payload["thinking"]["budget_tokens"], 1024);
        assert_eq!(request.payload["messages"][0]["role"], "user");
        assert!(request
            .headers
            .iter()
            .any(|(name, value)| name == "anthropic-beta" && value == "computer-use-2025-01-24"));
    }

    #[test]
    fn test_cache_control_passthrough() {
        let adapter = AnthropicAdapter::new().unwrap();
        let mut transcript = sample_transcript();
        if let Some(last) = transcript
            .messages
            .last_mut()
            .and_then(|m| m.segments.last_mut())
        {
            last.set_cache_control(true);
        }

        let request = adapter
            .prepare_request(&transcript, &[], &options_for("https://example.test"))
            .unwrap();
        assert_eq!(
            request.payload["messages"][0]["content"][0]["cache_control"]["type"],
            "ephemeral"
        );
    }

    #[test]
    fn test_invalid_transcript_rejected() {
        let adapter = AnthropicAdapter::new().unwrap();
        let mut transcript = Transcript::new();
        transcript.push(Message::user().with_tool_result(ToolResultSegment {
            call_id: "orphan".to_string(),
            output_text: None,
            images: vec![],
            is_error: false,
            system_note: None,
            annotations: None,
        }));
        let err = adapter
            .prepare_request(&transcript, &[], &options_for("https://example.test"))
            .unwrap_err();
        assert!(err.to_string().contains("invalid transcript"));
    }

    #[tokio::test]
    async fn test_invoke_and_parse_tool_use() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test_api_key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_123",
                "type": "message",
                "role": "assistant",
                "content": [
                    {"type": "text", "text": "Taking a screenshot."},
                    {"type": "tool_use", "id": "toolu_1", "name": "computer",
                     "input": {"action": "screenshot"}}
                ],
                "stop_reason": "tool_use",
                "usage": {"input_tokens": 42, "output_tokens": 7}
            })))
            .mount(&mock_server)
            .await;

        let adapter = AnthropicAdapter::new().unwrap();
        let request = adapter
            .prepare_request(&sample_transcript(), &[], &options_for(&mock_server.uri()))
            .unwrap();
        let response = adapter.invoke(&request).await.unwrap();
        let message = adapter.parse_response(&response).unwrap();

        assert_eq!(message.segments.len(), 2);
        assert_eq!(message.segments[0].as_text(), Some("Taking a screenshot."));
        let call = message.segments[1].as_tool_call().unwrap();
        assert_eq!(call.tool_name, "computer");
        assert_eq!(call.call_id, "toolu_1");
        assert_eq!(message.usage(), (42, 7));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(529).set_body_json(json!({"error": "overloaded"})),
            )
            .mount(&mock_server)
            .await;

        let adapter = AnthropicAdapter::new().unwrap();
        let request = adapter
            .prepare_request(&sample_transcript(), &[], &options_for(&mock_server.uri()))
            .unwrap();
        let err = adapter.invoke(&request).await.unwrap_err();
        assert!(matches!(err, ProviderError::Transient { .. }));
    }

    #[tokio::test]
    async fn test_client_error_is_fatal() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "bad request"})),
            )
            .mount(&mock_server)
            .await;

        let adapter = AnthropicAdapter::new().unwrap();
        let request = adapter
            .prepare_request(&sample_transcript(), &[], &options_for(&mock_server.uri()))
            .unwrap();
        let err = adapter.invoke(&request).await.unwrap_err();
        assert!(matches!(err, ProviderError::Fatal { .. }));
    }

    #[test]
    fn test_round_trip_preserves_pairing() {
        let adapter = AnthropicAdapter::new().unwrap();
        let mut arguments = Map::new();
        arguments.insert("command".to_string(), json!("ls"));

        let mut transcript = sample_transcript();
        transcript.push(
            Message::assistant()
                .with_text("Listing the directory.")
                .with_tool_call("bash", arguments, "toolu_9"),
        );
        transcript.push(Message::user().with_tool_result(ToolResultSegment {
            call_id: "toolu_9".to_string(),
            output_text: Some("file.txt".to_string()),
            images: vec![ImageSource::base64("image/png", "aGk=")],
            is_error: false,
            system_note: None,
            annotations: None,
        }));

        let request = adapter
            .prepare_request(&transcript, &[], &options_for("https://example.test"))
            .unwrap();
        let blocks = &request.payload["messages"][2]["content"];
        assert_eq!(blocks[0]["type"], "tool_result");
        assert_eq!(blocks[0]["tool_use_id"], "toolu_9");
        assert_eq!(blocks[0]["content"][0]["text"], "file.txt");
        assert_eq!(blocks[0]["content"][1]["source"]["type"], "base64");

        // And back: the wire block decodes to the same canonical segment.
        let segment = block_to_segment(&blocks[0]).unwrap();
        let result = segment.as_tool_result().unwrap();
        assert_eq!(result.call_id, "toolu_9");
        assert_eq!(result.images.len(), 1);
    }
}
