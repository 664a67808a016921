//! Translation between gantry's message model and the Anthropic Messages
//! API wire format.

use gantry_core::message::{Message, MessagePart, Role};
use gantry_tool_runtime::provider::ChatRequest;
use gantry_tool_runtime::tool::ToolDefinition;
use serde_json::{json, Value};

/// Build the `/v1/messages` request body for a streaming call.
pub(super) fn build_request(model: &str, request: &ChatRequest) -> Value {
    let messages: Vec<Value> = request.messages.iter().filter_map(message_to_wire).collect();
    let mut body = json!({
        "model": model,
        "messages": messages,
        "temperature": request.temperature,
        "max_tokens": request.max_tokens,
        "stream": true,
    });

    let tools: Vec<Value> = request.tools.iter().map(tool_definition_to_wire).collect();
    if !tools.is_empty() {
        body["tools"] = json!(tools);
    }
    if let Some(instructions) = &request.instructions {
        body["system"] = json!(instructions);
    }
    body
}

/// Map one history message to a wire message. System messages are carried
/// in the request's `system` field instead and yield `None` here.
pub(super) fn message_to_wire(message: &Message) -> Option<Value> {
    match message.role {
        Role::System => None,
        Role::User => Some(json!({
            "role": "user",
            "content": [{"type": "text", "text": message.text()}],
        })),
        Role::Assistant => {
            let mut content = Vec::new();
            for part in &message.parts {
                match part {
                    MessagePart::Text { text } => {
                        content.push(json!({"type": "text", "text": text}));
                    }
                    MessagePart::ToolCall(call) => {
                        content.push(json!({
                            "type": "tool_use",
                            "id": call.call_id,
                            "name": call.name,
                            "input": call.arguments,
                        }));
                    }
                    // Reasoning is not replayed: the wire format only
                    // accepts signed thinking blocks from its own output.
                    MessagePart::Reasoning { .. } => {}
                    MessagePart::ToolResult(_) => {}
                }
            }
            if content.is_empty() {
                // The API rejects empty content arrays.
                content.push(json!({"type": "text", "text": ""}));
            }
            Some(json!({"role": "assistant", "content": content}))
        }
        // Tool results go back as user-role tool_result blocks.
        Role::Tool => {
            let mut content = Vec::new();
            for part in &message.parts {
                match part {
                    MessagePart::ToolResult(result) => {
                        content.push(json!({
                            "type": "tool_result",
                            "tool_use_id": result.call_id,
                            "content": result.content,
                            "is_error": result.is_error,
                        }));
                    }
                    // Aggregate error summaries ride along as plain text.
                    MessagePart::Text { text } => {
                        content.push(json!({"type": "text", "text": text}));
                    }
                    _ => {}
                }
            }
            Some(json!({"role": "user", "content": content}))
        }
    }
}

pub(super) fn tool_definition_to_wire(definition: &ToolDefinition) -> Value {
    json!({
        "name": definition.name,
        "description": definition.description,
        "input_schema": definition.input_schema,
    })
}
