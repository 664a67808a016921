use crate::message::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};

/// Why a turn ended. Error turns terminate with `run_error` instead and
/// carry no finished reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishedReason {
    /// The model produced a response with no further tool calls.
    Completed,
    /// Iteration middleware skipped tool execution and ended the turn.
    ToolsSkipped,
    /// The iteration budget ran out and no continuation was approved.
    IterationLimit,
    /// The caller cancelled the turn.
    Cancelled,
}

/// Permission prompt emitted by middleware before a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Caller's reply to a [`PermissionRequest`], echoing its `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub request_id: String,
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Prompt for extending the iteration budget mid-turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationRequest {
    pub request_id: String,
    pub iterations_used: usize,
    pub limit: usize,
}

/// Caller's reply to a [`ContinuationRequest`]. `approved` with zero
/// `extensions` grants nothing; the loop then stops at the limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuationResponse {
    pub request_id: String,
    pub approved: bool,
    #[serde(default)]
    pub extensions: usize,
}

/// Everything that can happen during a turn, as a tagged variant.
/// The `type` discriminator doubles as the wire name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // Lifecycle
    RunStarted { agent: String },
    RunFinished { reason: FinishedReason },
    RunError { message: String, recoverable: bool },
    StepStarted { index: usize },
    StepFinished { index: usize },

    // Text
    TextMessageStart { message_id: String },
    TextMessageContent { message_id: String, delta: String },
    TextMessageEnd { message_id: String },

    // Reasoning
    ReasoningStart { message_id: String },
    ReasoningContent { message_id: String, delta: String },
    ReasoningEnd { message_id: String },

    // Tool
    ToolCallStart { call_id: String, name: String },
    ToolCallArgsDelta { call_id: String, delta: String },
    ToolCallEnd { call_id: String },
    ToolResult { call_id: String, content: String, is_error: bool },

    // Middleware
    PermissionRequest(PermissionRequest),
    PermissionResponse(PermissionResponse),
    ContinuationRequest(ContinuationRequest),
    ContinuationResponse(ContinuationResponse),
    FilterProgress { selected: usize, total: usize },
    FilterError { message: String, fallback: String },
    CustomEvent { name: String, payload: Value },

    // State
    StateSnapshot { state: Value },
    StateDelta { delta: Value },
    MessagesSnapshot { messages: Vec<Message> },
}

impl EventKind {
    /// Wire name of this event, identical to the serialized `type` field.
    pub fn wire_name(&self) -> &'static str {
        match self {
            EventKind::RunStarted { .. } => "run_started",
            EventKind::RunFinished { .. } => "run_finished",
            EventKind::RunError { .. } => "run_error",
            EventKind::StepStarted { .. } => "step_started",
            EventKind::StepFinished { .. } => "step_finished",
            EventKind::TextMessageStart { .. } => "text_message_start",
            EventKind::TextMessageContent { .. } => "text_message_content",
            EventKind::TextMessageEnd { .. } => "text_message_end",
            EventKind::ReasoningStart { .. } => "reasoning_start",
            EventKind::ReasoningContent { .. } => "reasoning_content",
            EventKind::ReasoningEnd { .. } => "reasoning_end",
            EventKind::ToolCallStart { .. } => "tool_call_start",
            EventKind::ToolCallArgsDelta { .. } => "tool_call_args_delta",
            EventKind::ToolCallEnd { .. } => "tool_call_end",
            EventKind::ToolResult { .. } => "tool_result",
            EventKind::PermissionRequest(_) => "permission_request",
            EventKind::PermissionResponse(_) => "permission_response",
            EventKind::ContinuationRequest(_) => "continuation_request",
            EventKind::ContinuationResponse(_) => "continuation_response",
            EventKind::FilterProgress { .. } => "filter_progress",
            EventKind::FilterError { .. } => "filter_error",
            EventKind::CustomEvent { .. } => "custom_event",
            EventKind::StateSnapshot { .. } => "state_snapshot",
            EventKind::StateDelta { .. } => "state_delta",
            EventKind::MessagesSnapshot { .. } => "messages_snapshot",
        }
    }

    /// `request_id` carried by request events.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            EventKind::PermissionRequest(r) => Some(&r.request_id),
            EventKind::ContinuationRequest(r) => Some(&r.request_id),
            _ => None,
        }
    }

    /// `request_id` echoed by response events, used for routing replies.
    pub fn response_request_id(&self) -> Option<&str> {
        match self {
            EventKind::PermissionResponse(r) => Some(&r.request_id),
            EventKind::ContinuationResponse(r) => Some(&r.request_id),
            _ => None,
        }
    }
}

/// A discrete, serializable record of something that happened during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(flatten)]
    pub kind: EventKind,
    /// Unix epoch milliseconds, strictly increasing within a process.
    pub timestamp: i64,
}

impl AgentEvent {
    /// Stamp `kind` with the current monotonic unix-ms timestamp.
    pub fn now(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: unix_ms_monotonic(),
        }
    }

    pub fn wire_name(&self) -> &'static str {
        self.kind.wire_name()
    }

    /// Whether this event ends the turn's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::RunFinished { .. } | EventKind::RunError { .. }
        )
    }

    /// Server-Sent-Event framing: `event: <type>` line, one `data:` line
    /// with the full JSON object, blank-line terminator.
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).expect("event serialization is infallible");
        format!("event: {}\ndata: {}\n\n", self.wire_name(), data)
    }
}

/// Typed extraction from a routed response event; `Err` hands the event
/// back so the coordinator can report what actually arrived.
pub trait FromEventKind: Sized {
    fn from_event(event: AgentEvent) -> Result<Self, AgentEvent>;
}

impl FromEventKind for PermissionResponse {
    fn from_event(event: AgentEvent) -> Result<Self, AgentEvent> {
        match event.kind {
            EventKind::PermissionResponse(resp) => Ok(resp),
            _ => Err(event),
        }
    }
}

impl FromEventKind for ContinuationResponse {
    fn from_event(event: AgentEvent) -> Result<Self, AgentEvent> {
        match event.kind {
            EventKind::ContinuationResponse(resp) => Ok(resp),
            _ => Err(event),
        }
    }
}

impl FromEventKind for AgentEvent {
    fn from_event(event: AgentEvent) -> Result<Self, AgentEvent> {
        Ok(event)
    }
}

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Current unix-ms, bumped past the previous value so event timestamps
/// never repeat or go backwards within a process.
pub fn unix_ms_monotonic() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    LAST_TIMESTAMP
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .map(|last| now.max(last + 1))
        .unwrap_or(now)
}
