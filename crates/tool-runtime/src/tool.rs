use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Where a tool came from, used to match scoped middleware.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOrigin {
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub skill: Option<String>,
}

/// Describes a tool's interface for model consumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name (e.g., "file_read")
    pub name: String,
    /// Human-readable description for the model
    pub description: String,
    /// JSON Schema describing the expected input
    pub input_schema: Value,
    #[serde(default)]
    pub origin: ToolOrigin,
}

impl fmt::Display for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.description)
    }
}

/// The primary extension point: all tools implement this trait.
///
/// Tools are object-safe, Send + Sync, async, and must not assume thread
/// affinity; the scheduler runs them from any worker.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool's definition (name, description, JSON Schema).
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given JSON input, returning the payload
    /// content handed back to the model.
    async fn invoke(&self, arguments: Value, cancel: &CancellationToken)
        -> Result<String, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Middleware '{middleware}' failed: {message}")]
    Middleware { middleware: String, message: String },
    /// Unrecoverable failure: the scheduler propagates this instead of
    /// capturing it per-call, ending the turn.
    #[error("Fatal: {0}")]
    Fatal(String),
    #[error("Cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Stub tool the runtime's own tests lean on: tags a snippet with a
/// bracketed label so its output is easy to spot in a transcript.
pub struct LabelTool;

#[async_trait]
impl Tool for LabelTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "label".to_string(),
            description: "Tags a snippet of text with a bracketed label for the transcript."
                .to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "snippet": {
                        "type": "string",
                        "description": "Text to tag"
                    },
                    "label": {
                        "type": "string",
                        "description": "Tag placed in front, defaults to 'note'"
                    }
                },
                "required": ["snippet"]
            }),
            origin: ToolOrigin::default(),
        }
    }

    async fn invoke(
        &self,
        arguments: Value,
        _cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        let snippet = arguments
            .get("snippet")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("'snippet' must be a string".to_string()))?;
        let label = arguments
            .get("label")
            .and_then(|v| v.as_str())
            .unwrap_or("note");
        Ok(format!("[{label}] {snippet}"))
    }
}
