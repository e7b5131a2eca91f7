use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ProviderError;
use crate::models::message::{Message, Transcript};
use crate::models::tool::ToolSpec;

/// Token counters reported by a backend for one model call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

/// Sampling parameters plus the open map for backend-specific knobs.
///
/// `extra_options` is the only mechanism for credentials, endpoints, beta
/// flags and similar; adapters ignore keys they do not understand.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub thinking_budget: Option<u32>,
    pub extra_options: Map<String, Value>,
}

impl ProviderOptions {
    pub fn new<S: Into<String>>(model: S) -> Self {
        Self {
            model: model.into(),
            temperature: 0.0,
            max_output_tokens: 4096,
            thinking_budget: None,
            extra_options: Map::new(),
        }
    }

    pub fn with_extra<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.extra_options.insert(key.into(), value);
        self
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra_options.get(key).and_then(Value::as_str)
    }

    /// Fetch a required extra option, failing with a configuration error.
    pub fn require_extra_str(&self, key: &str) -> Result<&str, ProviderError> {
        self.extra_str(key).ok_or_else(|| {
            ProviderError::Configuration(format!("missing required option '{key}'"))
        })
    }
}

/// Adapter-built HTTP envelope for one model call. The payload's field names
/// are owned by the adapter that built it; callers treat it as opaque apart
/// from handing it to the same adapter's `invoke`.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub payload: Value,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status: u16,
    pub payload: Value,
}

/// Invoked with the raw request, the response (when one arrived) and the error
/// (when one occurred) for every network exchange. Used for debugging/audit.
pub type ExchangeCallback =
    Arc<dyn Fn(&ProviderRequest, Option<&ProviderResponse>, Option<&ProviderError>) + Send + Sync>;

/// Backend-specific translator between the canonical conversation model and a
/// wire protocol. Any new backend is a new implementation of this trait, never
/// a change to the sampling loop.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Build a request from the transcript without mutating it.
    fn prepare_request(
        &self,
        transcript: &Transcript,
        tools: &[ToolSpec],
        options: &ProviderOptions,
    ) -> Result<ProviderRequest, ProviderError>;

    /// Perform exactly one network round trip. Retries are the caller's
    /// responsibility.
    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Convert the native response shape into one canonical assistant message,
    /// recording token usage in `metadata["usage"]`.
    fn parse_response(&self, response: &ProviderResponse) -> Result<Message, ProviderError>;

    /// Whether the backend has a native reasoning channel. Thinking segments
    /// are dropped on request construction when unsupported, never fabricated
    /// on parse.
    fn supports_thinking(&self) -> bool {
        false
    }

    /// Whether tool results may carry image payloads on the wire.
    fn supports_image_outputs(&self) -> bool {
        true
    }

    /// Whether the backend honors prompt-cache breakpoints.
    fn supports_prompt_caching(&self) -> bool {
        false
    }
}

/// Shared single-shot POST used by the concrete adapters: one round trip,
/// 429/5xx classified transient, other non-2xx fatal.
pub(crate) async fn post_json(
    client: &reqwest::Client,
    request: &ProviderRequest,
    callback: Option<&ExchangeCallback>,
) -> Result<ProviderResponse, ProviderError> {
    let mut builder = client.post(&request.url).json(&request.payload);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    if let Some(timeout) = request.timeout {
        builder = builder.timeout(timeout);
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(err) => {
            let provider_err = ProviderError::from(err);
            if let Some(callback) = callback {
                callback(request, None, Some(&provider_err));
            }
            return Err(provider_err);
        }
    };

    let status = response.status();
    let payload: Value = match response.json().await {
        Ok(payload) => payload,
        Err(err) => {
            let provider_err = ProviderError::Fatal {
                status: Some(status.as_u16()),
                message: format!("invalid JSON response: {err}"),
            };
            if let Some(callback) = callback {
                callback(request, None, Some(&provider_err));
            }
            return Err(provider_err);
        }
    };

    let provider_response = ProviderResponse {
        status: status.as_u16(),
        payload,
    };

    if status.is_success() {
        if let Some(callback) = callback {
            callback(request, Some(&provider_response), None);
        }
        return Ok(provider_response);
    }

    let message = provider_response
        .payload
        .get("error")
        .map(|e| e.to_string())
        .unwrap_or_else(|| format!("request failed with status {status}"));
    let err = if status.as_u16() == 429 || status.is_server_error() {
        ProviderError::Transient {
            status: Some(status.as_u16()),
            message,
        }
    } else {
        ProviderError::Fatal {
            status: Some(status.as_u16()),
            message,
        }
    };
    if let Some(callback) = callback {
        callback(request, Some(&provider_response), Some(&err));
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_require_extra_str() {
        let options = ProviderOptions::new("model-a").with_extra("api_key", json!("secret"));
        assert_eq!(options.require_extra_str("api_key").unwrap(), "secret");

        let err = options.require_extra_str("base_url").unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn test_options_defaults() {
        let options = ProviderOptions::new("model-a");
        assert_eq!(options.temperature, 0.0);
        assert_eq!(options.max_output_tokens, 4096);
        assert!(options.thinking_budget.is_none());
    }
}
