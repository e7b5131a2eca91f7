use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::errors::ProviderError;
use crate::models::message::{Message, Segment, ToolCallSegment, ToolResultSegment, Transcript};
use crate::models::role::Role;
use crate::models::tool::ToolSpec;

use super::base::{
    post_json, ExchangeCallback, ProviderAdapter, ProviderOptions, ProviderRequest,
    ProviderResponse,
};
use super::utils::{
    check_context_length_error, decode_arguments, infer_tool_name, is_valid_function_name,
    recover_embedded_tool_calls, sanitize_function_name,
};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_OPENAI_ENDPOINT: &str = "/v1/chat/completions";

/// Adapter for generic OpenAI-compatible chat-completion backends, including
/// local servers (Ollama, vLLM, llama.cpp) whose smaller models sometimes emit
/// tool calls as JSON text instead of the structured field.
pub struct OpenAiAdapter {
    client: reqwest::Client,
    exchange_callback: Option<ExchangeCallback>,
}

impl OpenAiAdapter {
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
impl ProviderAdapter for OpenAiAdapter {
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

        let base_url = options
            .extra_str("base_url")
            .unwrap_or(DEFAULT_OPENAI_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let endpoint = options
            .extra_str("endpoint")
            .unwrap_or(DEFAULT_OPENAI_ENDPOINT);
        let multimodal = options
            .extra_options
            .get("multimodal_tool_results")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut messages: Vec<Value> = transcript
            .system_prompts
            .iter()
            .filter(|prompt| !prompt.is_empty())
            .map(|prompt| json!({"role": "system", "content": prompt}))
            .collect();
        for message in &transcript.messages {
            messages.extend(flatten_message(message, multimodal));
        }

        let mut payload = json!({
            "model": options.model,
            "messages": messages,
            "temperature": options.temperature,
            "max_tokens": options.max_output_tokens,
        });
        if !tools.is_empty() {
            let tools_payload: Vec<Value> = tools.iter().map(tool_spec_to_function).collect();
            payload["tools"] = json!(tools_payload);
            payload["tool_choice"] = json!(options.extra_str("tool_choice").unwrap_or("auto"));
        }
        if let Some(response_format) = options.extra_options.get("response_format") {
            payload["response_format"] = response_format.clone();
        }

        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        if let Some(api_key) = options.extra_str("api_key") {
            headers.push(("Authorization".to_string(), format!("Bearer {api_key}")));
        }
        if let Some(extra_headers) =
            options.extra_options.get("headers").and_then(Value::as_object)
        {
            for (name, value) in extra_headers {
                if let Some(value) = value.as_str() {
                    headers.push((name.clone(), value.to_string()));
                }
            }
        }

        let timeout = options
            .extra_options
            .get("timeout")
            .and_then(Value::as_f64)
            .map(Duration::from_secs_f64);

        Ok(ProviderRequest {
            url: format!("{base_url}{endpoint}"),
            headers,
            payload,
            timeout,
        })
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        post_json(&self.client, request, self.exchange_callback.as_ref()).await
    }

    fn parse_response(&self, response: &ProviderResponse) -> Result<Message, ProviderError> {
        if let Some(error) = response.payload.get("error") {
            if let Some(err) = check_context_length_error(error) {
                return Err(err);
            }
            return Err(ProviderError::Fatal {
                status: Some(response.status),
                message: format!("backend error: {error}"),
            });
        }

        let choice = response
            .payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .ok_or_else(|| ProviderError::Fatal {
                status: Some(response.status),
                message: "response missing choices".to_string(),
            })?;
        let message_payload = choice.get("message").cloned().unwrap_or_else(|| json!({}));

        let mut message = Message::assistant();
        let text = collect_text_content(&message_payload);

        let mut calls = parse_structured_tool_calls(&message_payload);
        let mut text_is_prose = text.is_some();
        if calls.is_empty() {
            // Known failure mode of smaller/local models: tool intent emitted
            // as a JSON object in plain text. When recovery succeeds the text
            // WAS the tool call and must not be kept as prose.
            if let Some(text) = &text {
                calls = recover_calls_from_text(text);
                if !calls.is_empty() {
                    text_is_prose = false;
                }
            }
        }
        if text_is_prose {
            if let Some(text) = &text {
                message.segments.push(Segment::text(text.clone()));
            }
        }
        for call in calls {
            message.segments.push(Segment::ToolCall(call));
        }

        let usage = response.payload.get("usage");
        let tokens = |name: &str| {
            usage
                .and_then(|u| u.get(name))
                .and_then(Value::as_u64)
                .unwrap_or(0)
        };
        message.record_usage(tokens("prompt_tokens"), tokens("completion_tokens"));
        if let Some(finish_reason) = choice.get("finish_reason") {
            message
                .metadata
                .insert("finish_reason".to_string(), finish_reason.clone());
        }
        Ok(message)
    }

    fn supports_thinking(&self) -> bool {
        false
    }

    fn supports_image_outputs(&self) -> bool {
        false
    }
}

fn flatten_message(message: &Message, multimodal: bool) -> Vec<Value> {
    match message.role {
        Role::Assistant => {
            let text = message.text();
            let tool_calls: Vec<Value> = message.tool_calls().map(tool_call_to_wire).collect();
            if text.is_empty() && tool_calls.is_empty() {
                return Vec::new();
            }
            let mut wire = json!({"role": "assistant", "content": text});
            if !tool_calls.is_empty() {
                wire["tool_calls"] = json!(tool_calls);
            }
            vec![wire]
        }
        Role::User => {
            let mut wire = Vec::new();
            let text = message.text();
            if !text.is_empty() {
                wire.push(json!({"role": "user", "content": text}));
            }
            for segment in &message.segments {
                if let Segment::ToolResult(result) = segment {
                    wire.extend(tool_result_to_wire(result, multimodal));
                }
            }
            wire
        }
        Role::System => {
            let text = message.text();
            if text.is_empty() {
                Vec::new()
            } else {
                vec![json!({"role": "system", "content": text})]
            }
        }
        Role::Tool => message
            .segments
            .iter()
            .filter_map(Segment::as_tool_result)
            .flat_map(|result| tool_result_to_wire(result, multimodal))
            .collect(),
    }
}

fn tool_call_to_wire(call: &ToolCallSegment) -> Value {
    let arguments =
        serde_json::to_string(&call.arguments).unwrap_or_else(|_| "{}".to_string());
    json!({
        "id": call.call_id,
        "type": "function",
        "function": {
            "name": sanitize_function_name(&call.tool_name),
            "arguments": arguments,
        }
    })
}

fn tool_result_to_wire(result: &ToolResultSegment, multimodal: bool) -> Vec<Value> {
    let mut parts: Vec<String> = Vec::new();
    if let Some(note) = &result.system_note {
        parts.push(format!("<system>{note}</system>"));
    }
    if let Some(output_text) = &result.output_text {
        parts.push(output_text.clone());
    }

    let mut wire = Vec::new();
    if multimodal && !result.images.is_empty() {
        let mut content: Vec<Value> = Vec::new();
        let text = parts.join("\n");
        if !text.is_empty() {
            content.push(json!({"type": "text", "text": text}));
        }
        for image in &result.images {
            content.push(json!({
                "type": "image_url",
                "image_url": {"url": image.to_data_uri()}
            }));
        }
        wire.push(json!({
            "role": "tool",
            "tool_call_id": result.call_id,
            "content": content,
        }));
    } else {
        if !result.images.is_empty() {
            parts.push(format!("[{} image(s) omitted]", result.images.len()));
        }
        wire.push(json!({
            "role": "tool",
            "tool_call_id": result.call_id,
            "content": parts.join("\n"),
        }));
    }
    wire
}

fn tool_spec_to_function(spec: &ToolSpec) -> Value {
    let parameters = if spec.input_schema.is_object() {
        spec.input_schema.clone()
    } else {
        json!({"type": "object", "properties": {}})
    };
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": parameters,
        }
    })
}

fn collect_text_content(message_payload: &Value) -> Option<String> {
    match message_payload.get("content") {
        Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
        Some(Value::Array(blocks)) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .filter(|text| !text.is_empty())
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n\n"))
            }
        }
        _ => None,
    }
}

fn parse_structured_tool_calls(message_payload: &Value) -> Vec<ToolCallSegment> {
    let mut calls = Vec::new();
    if let Some(tool_calls) = message_payload.get("tool_calls").and_then(Value::as_array) {
        for call in tool_calls {
            let function = call.get("function").cloned().unwrap_or_else(|| json!({}));
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !is_valid_function_name(name) {
                continue;
            }
            let arguments = function
                .get("arguments")
                .map(decode_arguments)
                .unwrap_or_default();
            calls.push(ToolCallSegment {
                tool_name: name.to_string(),
                arguments,
                call_id: call
                    .get("id")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(new_call_id),
            });
        }
    }
    // Legacy single function_call field.
    if calls.is_empty() {
        if let Some(function_call) = message_payload.get("function_call") {
            let name = function_call
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if is_valid_function_name(name) {
                calls.push(ToolCallSegment {
                    tool_name: name.to_string(),
                    arguments: function_call
                        .get("arguments")
                        .map(decode_arguments)
                        .unwrap_or_default(),
                    call_id: new_call_id(),
                });
            }
        }
    }
    calls
}

fn recover_calls_from_text(text: &str) -> Vec<ToolCallSegment> {
    recover_embedded_tool_calls(text)
        .into_iter()
        .filter_map(|recovered| {
            let tool_name = recovered
                .tool_name
                .or_else(|| infer_tool_name(&recovered.arguments).map(String::from))?;
            Some(ToolCallSegment {
                tool_name,
                arguments: recovered.arguments,
                call_id: new_call_id(),
            })
        })
        .collect()
}

fn new_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::content::ImageSource;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options_for(base_url: &str) -> ProviderOptions {
        ProviderOptions::new("gpt-4o")
            .with_extra("api_key", json!("test_api_key"))
            .with_extra("base_url", json!(base_url))
    }

    fn parse(payload: Value) -> Message {
        let adapter = OpenAiAdapter::new().unwrap();
        adapter
            .parse_response(&ProviderResponse {
                status: 200,
                payload,
            })
            .unwrap()
    }

    #[test]
    fn test_prepare_request_flattens_transcript() {
        let adapter = OpenAiAdapter::new().unwrap();
        let mut arguments = Map::new();
        arguments.insert("command".to_string(), json!("ls"));

        let mut transcript = Transcript::new().with_system_prompt("Be careful.");
        transcript.push(Message::user().with_text("List the files"));
        transcript.push(
            Message::assistant()
                .with_text("Listing now.")
                .with_tool_call("bash", arguments, "call_1"),
        );
        transcript.push(Message::user().with_tool_result(ToolResultSegment {
            call_id: "call_1".to_string(),
            output_text: Some("file.txt".to_string()),
            images: vec![ImageSource::base64("image/png", "aGk=")],
            is_error: false,
            system_note: Some("display 1".to_string()),
            annotations: None,
        }));

        let tool = ToolSpec::new("bash", "Run a command", json!({"type": "object"}));
        let request = adapter
            .prepare_request(&transcript, &[tool], &options_for("https://example.test"))
            .unwrap();

        assert_eq!(request.url, "https://example.test/v1/chat/completions");
        let messages = request.payload["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["arguments"],
            "{\"command\":\"ls\"}"
        );
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        let content = messages[3]["content"].as_str().unwrap();
        assert!(content.starts_with("<system>display 1</system>"));
        assert!(content.contains("[1 image(s) omitted]"));
        assert_eq!(request.payload["tool_choice"], "auto");
    }

    #[test]
    fn test_multimodal_tool_results_embed_data_uris() {
        let adapter = OpenAiAdapter::new().unwrap();
        let mut transcript = Transcript::new();
        transcript.push(Message::assistant().with_tool_call("computer", Map::new(), "call_1"));
        transcript.push(Message::user().with_tool_result(ToolResultSegment {
            call_id: "call_1".to_string(),
            output_text: None,
            images: vec![ImageSource::base64("image/png", "aGk=")],
            is_error: false,
            system_note: None,
            annotations: None,
        }));

        let options = options_for("https://example.test")
            .with_extra("multimodal_tool_results", json!(true));
        let request = adapter.prepare_request(&transcript, &[], &options).unwrap();
        let tool_message = &request.payload["messages"][1];
        assert_eq!(
            tool_message["content"][0]["image_url"]["url"],
            "data:image/png;base64,aGk="
        );
    }

    #[test]
    fn test_parse_structured_tool_calls() {
        let message = parse(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "bash", "arguments": "{\"command\":\"ls\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 4}
        }));

        assert_eq!(message.segments.len(), 1);
        let call = message.segments[0].as_tool_call().unwrap();
        assert_eq!(call.tool_name, "bash");
        assert_eq!(call.call_id, "call_9");
        assert_eq!(call.arguments.get("command"), Some(&json!("ls")));
        assert_eq!(message.usage(), (10, 4));
        assert_eq!(message.metadata["finish_reason"], "tool_calls");
    }

    #[test]
    fn test_parse_recovers_embedded_json_tool_call() {
        let message = parse(json!({
            "choices": [{
                "message": {
                    "content": "{\"type\":\"function\",\"name\":\"bash\",\"arguments\":{\"command\":\"ls\"}}"
                },
                "finish_reason": "stop"
            }]
        }));

        assert_eq!(message.segments.len(), 1);
        let call = message.segments[0].as_tool_call().unwrap();
        assert_eq!(call.tool_name, "bash");
        assert_eq!(call.arguments.get("command"), Some(&json!("ls")));
        // Usage defaults to zero when the backend reports none.
        assert_eq!(message.usage(), (0, 0));
    }

    #[test]
    fn test_parse_infers_tool_name_from_argument_shape() {
        let message = parse(json!({
            "choices": [{
                "message": {
                    "content": "{\"type\":\"function\",\"arguments\":{\"action\":\"left_click\",\"coordinate\":[100,200]}}"
                }
            }]
        }));

        let call = message.segments[0].as_tool_call().unwrap();
        assert_eq!(call.tool_name, "computer");
    }

    #[test]
    fn test_parse_bad_arguments_degrade_to_raw() {
        let message = parse(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "bash", "arguments": "not json {"}
                    }]
                }
            }]
        }));

        let call = message.segments[0].as_tool_call().unwrap();
        assert_eq!(call.arguments.get("raw"), Some(&json!("not json {")));
    }

    #[test]
    fn test_parse_plain_text_is_text() {
        let message = parse(json!({
            "choices": [{
                "message": {"content": "All done."},
                "finish_reason": "stop"
            }]
        }));
        assert_eq!(message.segments.len(), 1);
        assert_eq!(message.segments[0].as_text(), Some("All done."));
    }

    #[test]
    fn test_parse_context_length_error() {
        let adapter = OpenAiAdapter::new().unwrap();
        let err = adapter
            .parse_response(&ProviderResponse {
                status: 200,
                payload: json!({
                    "error": {"code": "context_length_exceeded", "message": "too long"}
                }),
            })
            .unwrap_err();
        assert!(matches!(err, ProviderError::ContextLengthExceeded(_)));
    }

    #[test]
    fn test_thinking_segments_dropped_on_request() {
        let adapter = OpenAiAdapter::new().unwrap();
        let mut transcript = Transcript::new();
        transcript.push(
            Message::assistant()
                .with_thinking("working through it", None)
                .with_text("Here is the answer."),
        );
        let request = adapter
            .prepare_request(&transcript, &[], &options_for("https://example.test"))
            .unwrap();
        assert_eq!(
            request.payload["messages"][0]["content"],
            "Here is the answer."
        );
    }

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {"content": "Hello!"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2}
            })))
            .mount(&mock_server)
            .await;

        let adapter = OpenAiAdapter::new().unwrap();
        let mut transcript = Transcript::new();
        transcript.push(Message::user().with_text("Hi"));
        let request = adapter
            .prepare_request(&transcript, &[], &options_for(&mock_server.uri()))
            .unwrap();
        let response = adapter.invoke(&request).await.unwrap();
        let message = adapter.parse_response(&response).unwrap();
        assert_eq!(message.text(), "Hello!");
        assert_eq!(message.usage(), (3, 2));
    }
}
