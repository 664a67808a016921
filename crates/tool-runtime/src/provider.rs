use crate::tool::ToolDefinition;
use async_trait::async_trait;
use futures::Stream;
use gantry_core::message::Message;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One incremental update from a streaming chat call.
/// Provider-agnostic: translated from each vendor's wire format in the
/// provider layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChatUpdate {
    /// A chunk of assistant text
    TextDelta { text: String },
    /// A chunk of model reasoning ("thinking") text
    ReasoningDelta { text: String },
    /// The model started a tool call
    ToolCallStart { call_id: String, name: String },
    /// Incremental JSON argument data for a tool call
    ToolCallArgsDelta { call_id: String, delta: String },
    /// Tool call arguments are complete
    ToolCallEnd { call_id: String },
    /// The response is complete
    Finish { reason: FinishReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// Normal end of response
    EndTurn,
    /// Model wants to use tools
    ToolUse,
    /// Hit max tokens limit
    MaxTokens,
    /// Stopped by stop sequence
    StopSequence,
}

/// Everything one streaming chat call needs.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// System instructions, if any.
    pub instructions: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_tokens: u32,
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatUpdate, LlmError>> + Send>>;

/// Trait for streaming chat providers with tool use.
///
/// This trait lives in tool-runtime (not in crates/llm) because it's
/// defined by the consumer (the agent loop), not the provider.
/// Implementations live in crates/llm.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Open a streaming response. The cancellation token ends the stream
    /// cooperatively.
    async fn stream_chat(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatStream, LlmError>;

    /// Provider name for logging/debugging (e.g., "anthropic", "mock")
    fn name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Authentication failed")]
    AuthError,
    #[error("Stream error: {0}")]
    StreamError(String),
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
    #[error("Cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Mock provider for testing the agent loop without real API calls.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Script {
        Updates(Vec<Result<ChatUpdate, LlmError>>),
        Failure(LlmError),
    }

    /// A mock provider that replays pre-scripted responses in FIFO order
    /// and records every request it receives.
    pub struct MockChatProvider {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl MockChatProvider {
        pub fn new() -> Self {
            Self {
                scripts: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Queue a full update script for the next call.
        pub fn queue_updates(&self, updates: Vec<ChatUpdate>) {
            self.scripts
                .lock()
                .unwrap()
                .push_back(Script::Updates(updates.into_iter().map(Ok).collect()));
        }

        /// Queue a simple text response.
        pub fn queue_text(&self, text: &str) {
            self.queue_updates(vec![
                ChatUpdate::TextDelta {
                    text: text.to_string(),
                },
                ChatUpdate::Finish {
                    reason: FinishReason::EndTurn,
                },
            ]);
        }

        /// Queue a response consisting of a single complete tool call.
        pub fn queue_tool_call(&self, call_id: &str, name: &str, arguments: &str) {
            self.queue_updates(vec![
                ChatUpdate::ToolCallStart {
                    call_id: call_id.to_string(),
                    name: name.to_string(),
                },
                ChatUpdate::ToolCallArgsDelta {
                    call_id: call_id.to_string(),
                    delta: arguments.to_string(),
                },
                ChatUpdate::ToolCallEnd {
                    call_id: call_id.to_string(),
                },
                ChatUpdate::Finish {
                    reason: FinishReason::ToolUse,
                },
            ]);
        }

        /// Queue a call-level failure: the next `stream_chat` returns `Err`.
        pub fn queue_failure(&self, error: LlmError) {
            self.scripts
                .lock()
                .unwrap()
                .push_back(Script::Failure(error));
        }

        /// Number of scripts not yet consumed.
        pub fn remaining(&self) -> usize {
            self.scripts.lock().unwrap().len()
        }

        /// Every request received so far, in call order.
        pub fn request_log(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl Default for MockChatProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ChatProvider for MockChatProvider {
        async fn stream_chat(
            &self,
            request: ChatRequest,
            _cancel: &CancellationToken,
        ) -> Result<ChatStream, LlmError> {
            self.requests.lock().unwrap().push(request);
            let script = self.scripts.lock().unwrap().pop_front();
            match script {
                Some(Script::Updates(updates)) => Ok(Box::pin(stream::iter(updates))),
                Some(Script::Failure(error)) => Err(error),
                // Out of scripts: end the turn immediately.
                None => Ok(Box::pin(stream::iter(vec![Ok(ChatUpdate::Finish {
                    reason: FinishReason::EndTurn,
                })]))),
            }
        }

        fn name(&self) -> &str {
            "mock"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockChatProvider;
    use super::*;
    use futures::StreamExt;

    fn request() -> ChatRequest {
        ChatRequest {
            messages: vec![Message::user("hi")],
            instructions: None,
            tools: vec![],
            temperature: 0.0,
            max_tokens: 128,
        }
    }

    #[tokio::test]
    async fn mock_replays_scripts_in_fifo_order() {
        let provider = MockChatProvider::new();
        provider.queue_text("first");
        provider.queue_text("second");

        let cancel = CancellationToken::new();
        for expected in ["first", "second"] {
            let mut stream = provider.stream_chat(request(), &cancel).await.unwrap();
            let first = stream.next().await.unwrap().unwrap();
            assert_eq!(
                first,
                ChatUpdate::TextDelta {
                    text: expected.to_string()
                }
            );
        }
        assert_eq!(provider.remaining(), 0);
    }

    #[tokio::test]
    async fn mock_failure_surfaces_at_call_time() {
        let provider = MockChatProvider::new();
        provider.queue_failure(LlmError::RateLimited {
            retry_after: Some(Duration::from_millis(100)),
        });
        provider.queue_text("after retry");

        let cancel = CancellationToken::new();
        let err = match provider.stream_chat(request(), &cancel).await {
            Err(e) => e,
            Ok(_) => panic!("expected stream_chat to fail"),
        };
        assert!(matches!(err, LlmError::RateLimited { .. }));

        let mut stream = provider.stream_chat(request(), &cancel).await.unwrap();
        assert!(matches!(
            stream.next().await.unwrap().unwrap(),
            ChatUpdate::TextDelta { .. }
        ));
    }
}
