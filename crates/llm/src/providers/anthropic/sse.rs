//! SSE event parsing and content-block state tracking for the Anthropic
//! streaming API.

use gantry_tool_runtime::provider::{ChatUpdate, FinishReason, LlmError};
use serde_json::Value;
use tracing::trace;

/// Per-block bookkeeping so argument deltas and block stops can be mapped
/// back to the tool_use id announced at block start.
pub(super) struct BlockTracker {
    blocks: Vec<Block>,
}

#[derive(Clone)]
enum Block {
    Text,
    Thinking,
    ToolUse { id: String },
    Other,
}

impl BlockTracker {
    pub(super) fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    fn register(&mut self, index: usize, block: Block) {
        if index >= self.blocks.len() {
            self.blocks.resize(index + 1, Block::Other);
        }
        self.blocks[index] = block;
    }

    fn tool_id(&self, index: usize) -> Option<&str> {
        match self.blocks.get(index) {
            Some(Block::ToolUse { id }) => Some(id),
            _ => None,
        }
    }
}

/// Parse a single SSE event (type + data) into zero or more stream items.
pub(super) fn parse_sse_event(
    event_type: &str,
    data: &str,
    tracker: &mut BlockTracker,
) -> Vec<Result<ChatUpdate, LlmError>> {
    let mut items = Vec::new();

    match event_type {
        "content_block_start" => {
            if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                let index = parsed["index"].as_u64().unwrap_or(0) as usize;
                let block = &parsed["content_block"];
                match block["type"].as_str() {
                    Some("text") => {
                        tracker.register(index, Block::Text);
                        if let Some(text) = block["text"].as_str() {
                            if !text.is_empty() {
                                items.push(Ok(ChatUpdate::TextDelta {
                                    text: text.to_string(),
                                }));
                            }
                        }
                    }
                    Some("thinking") => {
                        tracker.register(index, Block::Thinking);
                        if let Some(text) = block["thinking"].as_str() {
                            if !text.is_empty() {
                                items.push(Ok(ChatUpdate::ReasoningDelta {
                                    text: text.to_string(),
                                }));
                            }
                        }
                    }
                    Some("tool_use") => {
                        let id = block["id"].as_str().unwrap_or("").to_string();
                        let name = block["name"].as_str().unwrap_or("").to_string();
                        tracker.register(index, Block::ToolUse { id: id.clone() });
                        items.push(Ok(ChatUpdate::ToolCallStart { call_id: id, name }));
                    }
                    _ => {
                        tracker.register(index, Block::Other);
                    }
                }
            }
        }
        "content_block_delta" => {
            if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                let index = parsed["index"].as_u64().unwrap_or(0) as usize;
                let delta = &parsed["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(text) = delta["text"].as_str() {
                            items.push(Ok(ChatUpdate::TextDelta {
                                text: text.to_string(),
                            }));
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) = delta["thinking"].as_str() {
                            items.push(Ok(ChatUpdate::ReasoningDelta {
                                text: text.to_string(),
                            }));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(json_str) = delta["partial_json"].as_str() {
                            if let Some(id) = tracker.tool_id(index) {
                                items.push(Ok(ChatUpdate::ToolCallArgsDelta {
                                    call_id: id.to_string(),
                                    delta: json_str.to_string(),
                                }));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        "content_block_stop" => {
            if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                let index = parsed["index"].as_u64().unwrap_or(0) as usize;
                // Only tool_use blocks need a terminator; text and thinking
                // blocks just stop producing deltas.
                if let Some(id) = tracker.tool_id(index) {
                    items.push(Ok(ChatUpdate::ToolCallEnd {
                        call_id: id.to_string(),
                    }));
                }
            }
        }
        "message_delta" => {
            if let Ok(parsed) = serde_json::from_str::<Value>(data) {
                if let Some(stop_reason) = parsed["delta"]["stop_reason"].as_str() {
                    let reason = match stop_reason {
                        "tool_use" => FinishReason::ToolUse,
                        "max_tokens" => FinishReason::MaxTokens,
                        "stop_sequence" => FinishReason::StopSequence,
                        _ => FinishReason::EndTurn,
                    };
                    items.push(Ok(ChatUpdate::Finish { reason }));
                }
            }
        }
        // message_delta already carried the stop reason; message_stop is a
        // sentinel, message_start and ping are informational.
        "message_stop" | "message_start" | "ping" => {}
        "error" => {
            let message = serde_json::from_str::<Value>(data)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(String::from))
                .unwrap_or_else(|| data.to_string());
            items.push(Err(LlmError::StreamError(message)));
        }
        _ => {
            trace!(event_type, "ignoring unknown SSE event type");
        }
    }

    items
}
