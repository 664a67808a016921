use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Role of a message in the conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A request from the model to invoke a named tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this invocation within a turn (used to match results)
    pub call_id: String,
    /// Tool name to execute
    pub name: String,
    /// JSON input arguments
    pub arguments: Value,
}

/// Result of executing a tool, sent back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Must match the ToolCall's `call_id`
    pub call_id: String,
    /// Result content (text, or structured data serialized to text)
    pub content: String,
    /// Whether this result represents an error
    pub is_error: bool,
}

/// One content block of a message. Assistant messages may mix text,
/// reasoning and tool calls in a single message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Reasoning { text: String },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

/// A message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<MessagePart>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            parts,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![MessagePart::Text { text: text.into() }])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![MessagePart::Text { text: text.into() }])
    }

    /// Assistant message carrying optional text, optional reasoning and any
    /// number of tool calls, in that order.
    pub fn assistant(
        text: Option<String>,
        reasoning: Option<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        let mut parts = Vec::new();
        if let Some(text) = reasoning {
            parts.push(MessagePart::Reasoning { text });
        }
        if let Some(text) = text {
            parts.push(MessagePart::Text { text });
        }
        parts.extend(tool_calls.into_iter().map(MessagePart::ToolCall));
        Self::new(Role::Assistant, parts)
    }

    /// Tool message aggregating the results of one execution batch.
    pub fn tool(results: Vec<ToolResult>) -> Self {
        Self::new(
            Role::Tool,
            results.into_iter().map(MessagePart::ToolResult).collect(),
        )
    }

    /// Concatenated text content of this message (reasoning excluded).
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// Tool calls carried by this message, in part order.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Tool results carried by this message, in part order.
    pub fn tool_results(&self) -> Vec<&ToolResult> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::ToolResult(result) => Some(result),
                _ => None,
            })
            .collect()
    }

    /// Append a plain-text part (used for aggregate error summaries).
    pub fn push_text(&mut self, text: impl Into<String>) {
        self.parts.push(MessagePart::Text { text: text.into() });
    }
}
