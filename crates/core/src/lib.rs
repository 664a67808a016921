pub mod coordinator;
pub mod event;
pub mod message;
pub mod options;

pub use coordinator::{CoordinatorError, EventDrainer, ResponseWaiter, TurnCoordinator};
pub use event::{
    AgentEvent, ContinuationRequest, ContinuationResponse, EventKind, FinishedReason,
    FromEventKind, PermissionRequest, PermissionResponse,
};
pub use message::{Message, MessagePart, Role, ToolCall, ToolResult};
pub use options::{AgentOptions, RetryPolicy, SelectionFallback, ToolSelection};
