use crate::tool::{Tool, ToolDefinition, ToolError};
use async_trait::async_trait;
use gantry_core::coordinator::{CoordinatorError, ResponseWaiter, TurnCoordinator};
use gantry_core::event::{EventKind, FromEventKind};
use gantry_core::message::{ToolCall, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Which tool invocations a middleware applies to. Execution order is by
/// scope rank (global → plugin → skill → function), then registration
/// order within a rank. Permission rules reuse the same scope model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewareScope {
    Global,
    Plugin(String),
    Skill(String),
    Function(String),
}

impl MiddlewareScope {
    pub(crate) fn rank(&self) -> u8 {
        match self {
            MiddlewareScope::Global => 0,
            MiddlewareScope::Plugin(_) => 1,
            MiddlewareScope::Skill(_) => 2,
            MiddlewareScope::Function(_) => 3,
        }
    }

    /// Whether this scope matches the given tool.
    pub fn applies_to(&self, definition: &ToolDefinition) -> bool {
        match self {
            MiddlewareScope::Global => true,
            MiddlewareScope::Plugin(plugin) => {
                definition.origin.plugin.as_deref() == Some(plugin.as_str())
            }
            MiddlewareScope::Skill(skill) => {
                definition.origin.skill.as_deref() == Some(skill.as_str())
            }
            MiddlewareScope::Function(name) => definition.name == *name,
        }
    }
}

/// State shared along one tool invocation's middleware chain.
pub struct InvocationContext {
    /// The tool call being executed; middleware may rewrite `arguments`
    /// before calling `next`.
    pub call: ToolCall,
    pub definition: ToolDefinition,
    /// Result of the invocation. Middleware may set it to short-circuit,
    /// or inspect/replace it after `next` returns.
    pub result: Option<ToolResult>,
    /// Set together with `result` to short-circuit: the rest of the chain
    /// and the tool itself are skipped.
    pub terminated: bool,
    pub properties: HashMap<String, Value>,
    coordinator: Arc<TurnCoordinator>,
    cancel: CancellationToken,
}

impl InvocationContext {
    pub fn new(
        call: ToolCall,
        definition: ToolDefinition,
        coordinator: Arc<TurnCoordinator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            call,
            definition,
            result: None,
            terminated: false,
            properties: HashMap::new(),
            coordinator,
            cancel,
        }
    }

    /// Emit an event onto the turn's shared channel.
    pub fn emit(&self, kind: EventKind) {
        self.coordinator.emit(kind);
    }

    /// Register a waiter for `request_id`. Register before emitting the
    /// request event so a fast responder cannot race the wait.
    pub fn register_waiter(&self, request_id: &str) -> ResponseWaiter {
        self.coordinator.register_waiter(request_id)
    }

    /// Await a typed response routed by `request_id`. The caller must have
    /// emitted the matching request event first.
    pub async fn wait_for_response<T: FromEventKind>(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> Result<T, CoordinatorError> {
        self.coordinator
            .wait_for_response(request_id, timeout, &self.cancel)
            .await
    }

    /// Await a previously registered waiter with this context's
    /// cancellation token.
    pub async fn wait<T: FromEventKind>(
        &self,
        waiter: ResponseWaiter,
        timeout: Duration,
    ) -> Result<T, CoordinatorError> {
        waiter.wait(timeout, &self.cancel).await
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Short-circuit with a synthetic result; `next` becomes a no-op.
    pub fn terminate_with(&mut self, content: impl Into<String>, is_error: bool) {
        self.result = Some(ToolResult {
            call_id: self.call.call_id.clone(),
            content: content.into(),
            is_error,
        });
        self.terminated = true;
    }
}

/// Code wrapping a single tool invocation. Implementations may inspect or
/// mutate the request before `next.run(ctx)`, short-circuit by setting the
/// result without calling `next`, and inspect or replace the result after.
#[async_trait]
pub trait FunctionMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    fn scope(&self) -> MiddlewareScope {
        MiddlewareScope::Global
    }

    async fn invoke(&self, ctx: &mut InvocationContext, next: Next<'_>) -> Result<(), ToolError>;
}

/// The remainder of a middleware chain, driven by an explicit slice
/// rather than nested closures so short-circuiting stays visible.
pub struct Next<'a> {
    chain: &'a [Arc<dyn FunctionMiddleware>],
    tool: &'a Arc<dyn Tool>,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut InvocationContext) -> Result<(), ToolError> {
        if ctx.terminated {
            trace!(call_id = %ctx.call.call_id, "chain terminated, skipping rest");
            return Ok(());
        }
        match self.chain.split_first() {
            Some((middleware, rest)) => {
                trace!(middleware = middleware.name(), call_id = %ctx.call.call_id, "entering middleware");
                middleware
                    .invoke(
                        ctx,
                        Next {
                            chain: rest,
                            tool: self.tool,
                        },
                    )
                    .await
            }
            None => {
                let content = self
                    .tool
                    .invoke(ctx.call.arguments.clone(), &ctx.cancel)
                    .await?;
                ctx.result = Some(ToolResult {
                    call_id: ctx.call.call_id.clone(),
                    content,
                    is_error: false,
                });
                Ok(())
            }
        }
    }
}

/// Ordered collection of function middleware with scope filtering.
pub struct FunctionPipeline {
    middlewares: Vec<Arc<dyn FunctionMiddleware>>,
}

impl FunctionPipeline {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    pub fn register(&mut self, middleware: Arc<dyn FunctionMiddleware>) {
        debug!(middleware = middleware.name(), "registering function middleware");
        self.middlewares.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Middleware applicable to `definition`, ordered by scope rank then
    /// registration order.
    pub fn applicable(&self, definition: &ToolDefinition) -> Vec<Arc<dyn FunctionMiddleware>> {
        let mut applicable: Vec<_> = self
            .middlewares
            .iter()
            .filter(|m| m.scope().applies_to(definition))
            .cloned()
            .collect();
        applicable.sort_by_key(|m| m.scope().rank());
        applicable
    }

    /// Run the applicable chain around one tool invocation.
    pub async fn dispatch(
        &self,
        tool: &Arc<dyn Tool>,
        ctx: &mut InvocationContext,
    ) -> Result<(), ToolError> {
        let chain = self.applicable(&ctx.definition);
        Next {
            chain: &chain,
            tool,
        }
        .run(ctx)
        .await
    }
}

impl Default for FunctionPipeline {
    fn default() -> Self {
        Self::new()
    }
}
