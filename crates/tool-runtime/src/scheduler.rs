use crate::middleware::{FunctionPipeline, InvocationContext};
use crate::registry::ToolRegistry;
use crate::tool::ToolError;
use futures::future;
use gantry_core::coordinator::TurnCoordinator;
use gantry_core::event::EventKind;
use gantry_core::message::{Message, ToolCall, ToolResult};
use gantry_core::options::AgentOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one tool-call batch: results in call order plus the failure
/// notes feeding the aggregate error summary.
#[derive(Debug)]
pub struct ToolExecutionOutcome {
    pub results: Vec<ToolResult>,
    failures: Vec<String>,
}

impl ToolExecutionOutcome {
    fn empty() -> Self {
        Self {
            results: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Trailing summary line present when any call failed.
    pub fn error_summary(&self) -> Option<String> {
        if self.failures.is_empty() {
            None
        } else {
            Some(format!("Tool Execution Errors: {}", self.failures.join("; ")))
        }
    }

    /// Build the tool message appended to history: per-call results in call
    /// order, then the error summary when present.
    pub fn into_message(self) -> Message {
        let summary = self.error_summary();
        let mut message = Message::tool(self.results);
        if let Some(summary) = summary {
            message.push_text(summary);
        }
        message
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Unrecoverable failure raised by a tool or middleware; ends the turn.
    #[error("fatal tool failure in '{call_id}': {message}")]
    Fatal { call_id: String, message: String },
    #[error("tool execution cancelled")]
    Cancelled,
}

/// Executes tool-call batches with a deterministic aggregation policy:
/// sequential below the parallel threshold, concurrent at or above it,
/// results always in call order, per-call failures captured rather than
/// cancelling siblings.
pub struct ToolScheduler {
    registry: Arc<ToolRegistry>,
    pipeline: Arc<FunctionPipeline>,
}

impl ToolScheduler {
    pub fn new(registry: Arc<ToolRegistry>, pipeline: Arc<FunctionPipeline>) -> Self {
        Self { registry, pipeline }
    }

    pub async fn execute(
        &self,
        calls: &[ToolCall],
        coordinator: &Arc<TurnCoordinator>,
        options: &AgentOptions,
        cancel: &CancellationToken,
    ) -> Result<ToolExecutionOutcome, ExecutionError> {
        if calls.is_empty() {
            return Ok(ToolExecutionOutcome::empty());
        }

        let concurrent = calls.len() >= 2 && calls.len() >= options.parallel_tool_threshold;
        let mut outcome = ToolExecutionOutcome::empty();

        if concurrent {
            info!(count = calls.len(), "executing tool calls concurrently");
            let settled = future::join_all(
                calls
                    .iter()
                    .map(|call| self.run_call(call, coordinator, cancel)),
            )
            .await;
            // join_all preserves input order, so aggregation follows the
            // order of `calls` regardless of completion order.
            for settled in settled {
                let (result, failure) = settled?;
                outcome.results.push(result);
                outcome.failures.extend(failure);
            }
        } else {
            info!(count = calls.len(), "executing tool calls sequentially");
            for call in calls {
                let (result, failure) = self.run_call(call, coordinator, cancel).await?;
                outcome.results.push(result);
                outcome.failures.extend(failure);
            }
        }

        Ok(outcome)
    }

    /// Run one call through the middleware pipeline, capturing non-fatal
    /// failures into an error result plus a summary note.
    async fn run_call(
        &self,
        call: &ToolCall,
        coordinator: &Arc<TurnCoordinator>,
        cancel: &CancellationToken,
    ) -> Result<(ToolResult, Option<String>), ExecutionError> {
        debug!(call_id = %call.call_id, tool = %call.name, "executing tool call");

        let Some(tool) = self.registry.get(&call.name) else {
            let content = format!("Unknown tool: {}", call.name);
            warn!(call_id = %call.call_id, tool = %call.name, "tool not registered");
            let result = ToolResult {
                call_id: call.call_id.clone(),
                content: content.clone(),
                is_error: true,
            };
            let note = format!("{}({}): {}", call.name, call.call_id, content);
            return Ok((result, Some(note)));
        };

        let mut ctx = InvocationContext::new(
            call.clone(),
            tool.definition(),
            coordinator.clone(),
            cancel.clone(),
        );

        match self.pipeline.dispatch(&tool, &mut ctx).await {
            Ok(()) => {
                let result = ctx.result.unwrap_or_else(|| ToolResult {
                    call_id: call.call_id.clone(),
                    content: String::new(),
                    is_error: false,
                });
                Ok((result, None))
            }
            Err(ToolError::Fatal(message)) => Err(ExecutionError::Fatal {
                call_id: call.call_id.clone(),
                message,
            }),
            Err(ToolError::Cancelled) => Err(ExecutionError::Cancelled),
            Err(err) => {
                warn!(call_id = %call.call_id, tool = %call.name, error = %err, "tool call failed");
                if let ToolError::Middleware {
                    middleware,
                    message,
                } = &err
                {
                    coordinator.emit(EventKind::FilterError {
                        message: format!("{middleware}: {message}"),
                        fallback: "error_result".to_string(),
                    });
                }
                let result = ToolResult {
                    call_id: call.call_id.clone(),
                    content: format!("Tool error: {}", err),
                    is_error: true,
                };
                let note = format!("{}({}): {}", call.name, call.call_id, err);
                Ok((result, Some(note)))
            }
        }
    }
}
