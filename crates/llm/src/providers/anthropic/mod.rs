//! [`ChatProvider`] implementation for the Anthropic Messages API.

mod sse;
mod translate;

use crate::error::classify;
use crate::registry::{ProviderConfig, ProviderFeatures, ProviderMetadata};
use async_trait::async_trait;
use bytesse::SseStreamState;
use futures::StreamExt;
use gantry_tool_runtime::provider::{ChatProvider, ChatRequest, ChatStream, ChatUpdate, LlmError};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic provider with streaming tool-use support.
///
/// Uses `/v1/messages` with `stream: true` and translates the SSE frames
/// into incremental [`ChatUpdate`]s for the agent loop.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url,
        }
    }

    /// Create a provider with sensible defaults.
    pub fn with_defaults(api_key: String) -> Self {
        Self::new(
            api_key,
            DEFAULT_MODEL.to_string(),
            DEFAULT_BASE_URL.to_string(),
        )
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    async fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatStream, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = translate::build_request(&self.model, &request);

        debug!(model = %self.model, url = %url, tools = request.tools.len(), "starting streaming request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            let header_retry = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body_text = response.text().await.unwrap_or_default();

            if status == 401 || status == 403 {
                return Err(LlmError::AuthError);
            }
            if status == 429 {
                let retry_after = header_retry.or_else(|| {
                    serde_json::from_str::<Value>(&body_text)
                        .ok()
                        .and_then(|v| v["error"]["retry_after_secs"].as_u64())
                        .map(Duration::from_secs)
                });
                return Err(LlmError::RateLimited { retry_after });
            }
            return Err(LlmError::ApiError {
                status,
                message: body_text,
            });
        }

        let state = SseStreamState::new(Box::pin(response.bytes_stream()));
        let updates = futures::stream::unfold(state, |mut state| async move {
            state.next_item().await.map(|item| (item, state))
        });

        Ok(Box::pin(updates.take_until(cancel.clone().cancelled_owned())))
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

/// Byte-stream to SSE-event pump feeding [`sse::parse_sse_event`].
mod bytesse {
    use super::*;
    use futures::Stream;
    use std::pin::Pin;

    type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

    pub(super) struct SseStreamState {
        bytes: ByteStream,
        buffer: String,
        tracker: sse::BlockTracker,
        pending: VecDeque<Result<ChatUpdate, LlmError>>,
        done: bool,
    }

    impl SseStreamState {
        pub(super) fn new(bytes: ByteStream) -> Self {
            Self {
                bytes,
                buffer: String::new(),
                tracker: sse::BlockTracker::new(),
                pending: VecDeque::new(),
                done: false,
            }
        }

        pub(super) async fn next_item(&mut self) -> Option<Result<ChatUpdate, LlmError>> {
            loop {
                if let Some(item) = self.pending.pop_front() {
                    return Some(item);
                }
                if self.done {
                    return None;
                }
                match self.bytes.next().await {
                    Some(Ok(chunk)) => {
                        self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(pos) = self.buffer.find("\n\n") {
                            let raw = self.buffer[..pos].to_string();
                            self.buffer.replace_range(..pos + 2, "");
                            self.handle_raw_event(&raw);
                        }
                    }
                    Some(Err(err)) => {
                        self.done = true;
                        self.pending
                            .push_back(Err(LlmError::StreamError(err.to_string())));
                    }
                    None => self.done = true,
                }
            }
        }

        /// Split one raw SSE frame into its `event:`/`data:` fields and
        /// hand it to the parser.
        fn handle_raw_event(&mut self, raw: &str) {
            let mut event_type = String::new();
            let mut data = String::new();
            for line in raw.lines() {
                let line = line.trim_end_matches('\r');
                if let Some(rest) = line.strip_prefix("event:") {
                    event_type = rest.trim().to_string();
                } else if let Some(rest) = line.strip_prefix("data:") {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(rest.trim_start());
                }
            }
            if !event_type.is_empty() {
                self.pending
                    .extend(sse::parse_sse_event(&event_type, &data, &mut self.tracker));
            }
        }
    }
}

/// Registry entry for the Anthropic provider.
pub struct AnthropicFeatures;

impl ProviderFeatures for AnthropicFeatures {
    fn create_chat_client(
        &self,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn ChatProvider>, LlmError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| LlmError::NotConfigured("anthropic: missing API key".to_string()))?;
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(Arc::new(AnthropicProvider::new(api_key, model, base_url)))
    }

    fn classify(&self, error: &LlmError) -> crate::error::ErrorClassification {
        classify(error)
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            supports_streaming: true,
            supports_function_calling: true,
            supports_vision: true,
        }
    }
}
