//! Scripted adapter for exercising the sampling loop without a network.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::errors::ProviderError;
use crate::models::message::{Message, Transcript};
use crate::models::tool::ToolSpec;

use super::base::{
    ProviderAdapter, ProviderOptions, ProviderRequest, ProviderResponse,
};

/// Replays a fixed sequence of replies, one per `invoke`. Each reply is either
/// an assistant message or an error to surface. Transcripts seen by
/// `prepare_request` are recorded for assertions.
pub struct MockAdapter {
    replies: Mutex<VecDeque<Result<Message, ProviderError>>>,
    pub seen_transcripts: Mutex<Vec<Transcript>>,
    prompt_caching: bool,
}

impl MockAdapter {
    pub fn new(replies: Vec<Result<Message, ProviderError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            seen_transcripts: Mutex::new(Vec::new()),
            prompt_caching: false,
        }
    }

    pub fn with_prompt_caching(mut self) -> Self {
        self.prompt_caching = true;
        self
    }

    pub fn remaining_replies(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn prepare_request(
        &self,
        transcript: &Transcript,
        _tools: &[ToolSpec],
        options: &ProviderOptions,
    ) -> Result<ProviderRequest, ProviderError> {
        self.seen_transcripts.lock().unwrap().push(transcript.clone());
        Ok(ProviderRequest {
            url: "mock://".to_string(),
            headers: Vec::new(),
            payload: json!({"model": options.model}),
            timeout: None,
        })
    }

    async fn invoke(&self, _request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Message::assistant().with_text("done")));
        let message = reply?;
        let payload = serde_json::to_value(&message).map_err(|e| ProviderError::Fatal {
            status: None,
            message: e.to_string(),
        })?;
        Ok(ProviderResponse {
            status: 200,
            payload,
        })
    }

    fn parse_response(&self, response: &ProviderResponse) -> Result<Message, ProviderError> {
        serde_json::from_value(response.payload.clone()).map_err(|e| ProviderError::Fatal {
            status: None,
            message: e.to_string(),
        })
    }

    fn supports_prompt_caching(&self) -> bool {
        self.prompt_caching
    }
}
