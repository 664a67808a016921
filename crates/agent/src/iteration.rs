use crate::runtime::AgentError;
use async_trait::async_trait;
use gantry_core::coordinator::TurnCoordinator;
use gantry_core::event::EventKind;
use gantry_core::message::{Message, ToolCall, ToolResult};
use gantry_core::options::AgentOptions;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Mutable per-iteration record shared with iteration middleware.
///
/// Middleware may rewrite `options.instructions`, flip the skip flags, and
/// stash values in `properties` (which carry over to later iterations).
/// Only the loop replaces `response`.
pub struct IterationContext {
    pub index: usize,
    pub agent_name: String,
    pub messages: Vec<Message>,
    pub options: AgentOptions,
    pub response: Option<Message>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    /// Skip the LLM call; the loop jumps to the post-hook with an empty
    /// response.
    pub skip_llm_call: bool,
    /// Skip tool execution; every pending call becomes a synthetic
    /// "skipped" result and the turn ends.
    pub skip_tool_execution: bool,
    pub properties: HashMap<String, Value>,
    coordinator: Arc<TurnCoordinator>,
}

impl IterationContext {
    pub fn new(
        index: usize,
        agent_name: String,
        messages: Vec<Message>,
        options: AgentOptions,
        coordinator: Arc<TurnCoordinator>,
    ) -> Self {
        Self {
            index,
            agent_name,
            messages,
            options,
            response: None,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            skip_llm_call: false,
            skip_tool_execution: false,
            properties: HashMap::new(),
            coordinator,
        }
    }

    /// Emit an event onto the turn's shared channel.
    pub fn emit(&self, kind: EventKind) {
        self.coordinator.emit(kind);
    }
}

/// Hooks around one iteration of the agent loop. All methods default to
/// no-ops so middleware only implements the phases it cares about.
#[async_trait]
pub trait IterationMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Before the LLM call.
    async fn before_iteration(&self, _ctx: &mut IterationContext) -> Result<(), AgentError> {
        Ok(())
    }

    /// After the LLM call, once pending tool calls are known.
    async fn before_tool_execution(&self, _ctx: &mut IterationContext) -> Result<(), AgentError> {
        Ok(())
    }

    /// After tool execution (or its skip).
    async fn after_iteration(&self, _ctx: &mut IterationContext) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Ordered iteration middleware. Every hook runs in registration order,
/// including `after_iteration` (the pipeline is a flat list, not nested
/// wrappers).
pub struct IterationPipeline {
    middlewares: Vec<Arc<dyn IterationMiddleware>>,
}

impl IterationPipeline {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    pub fn register(&mut self, middleware: Arc<dyn IterationMiddleware>) {
        self.middlewares.push(middleware);
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub async fn run_before_iteration(&self, ctx: &mut IterationContext) -> Result<(), AgentError> {
        for middleware in &self.middlewares {
            trace!(middleware = middleware.name(), index = ctx.index, "before_iteration");
            middleware.before_iteration(ctx).await?;
        }
        Ok(())
    }

    pub async fn run_before_tool_execution(
        &self,
        ctx: &mut IterationContext,
    ) -> Result<(), AgentError> {
        for middleware in &self.middlewares {
            trace!(middleware = middleware.name(), index = ctx.index, "before_tool_execution");
            middleware.before_tool_execution(ctx).await?;
        }
        Ok(())
    }

    pub async fn run_after_iteration(&self, ctx: &mut IterationContext) -> Result<(), AgentError> {
        for middleware in &self.middlewares {
            trace!(middleware = middleware.name(), index = ctx.index, "after_iteration");
            middleware.after_iteration(ctx).await?;
        }
        Ok(())
    }
}

impl Default for IterationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Emits a `messages_snapshot` of the post-iteration history after every
/// iteration.
pub struct MessagesSnapshotMiddleware;

#[async_trait]
impl IterationMiddleware for MessagesSnapshotMiddleware {
    fn name(&self) -> &'static str {
        "messages_snapshot"
    }

    async fn after_iteration(&self, ctx: &mut IterationContext) -> Result<(), AgentError> {
        ctx.emit(EventKind::MessagesSnapshot {
            messages: ctx.messages.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl IterationMiddleware for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn before_iteration(&self, _ctx: &mut IterationContext) -> Result<(), AgentError> {
            self.log.lock().unwrap().push(format!("{}:before", self.name));
            Ok(())
        }
        async fn after_iteration(&self, _ctx: &mut IterationContext) -> Result<(), AgentError> {
            self.log.lock().unwrap().push(format!("{}:after", self.name));
            Ok(())
        }
    }

    fn context() -> (IterationContext, gantry_core::coordinator::EventDrainer) {
        let (coordinator, drainer) = TurnCoordinator::new();
        (
            IterationContext::new(
                0,
                "test".to_string(),
                vec![],
                AgentOptions::default(),
                coordinator,
            ),
            drainer,
        )
    }

    #[tokio::test]
    async fn hooks_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = IterationPipeline::new();
        pipeline.register(Arc::new(Recorder {
            name: "first",
            log: log.clone(),
        }));
        pipeline.register(Arc::new(Recorder {
            name: "second",
            log: log.clone(),
        }));

        let (mut ctx, _drainer) = context();
        pipeline.run_before_iteration(&mut ctx).await.unwrap();
        pipeline.run_after_iteration(&mut ctx).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:before", "second:before", "first:after", "second:after"]
        );
    }

    #[tokio::test]
    async fn middleware_can_flip_skip_flags() {
        struct Skipper;

        #[async_trait]
        impl IterationMiddleware for Skipper {
            fn name(&self) -> &'static str {
                "skipper"
            }
            async fn before_iteration(
                &self,
                ctx: &mut IterationContext,
            ) -> Result<(), AgentError> {
                ctx.skip_llm_call = true;
                Ok(())
            }
        }

        let mut pipeline = IterationPipeline::new();
        pipeline.register(Arc::new(Skipper));
        let (mut ctx, _drainer) = context();
        pipeline.run_before_iteration(&mut ctx).await.unwrap();
        assert!(ctx.skip_llm_call);
    }

    #[tokio::test]
    async fn snapshot_middleware_emits_current_messages() {
        let mut pipeline = IterationPipeline::new();
        pipeline.register(Arc::new(MessagesSnapshotMiddleware));
        let (mut ctx, drainer) = context();
        ctx.messages = vec![Message::user("hello")];

        pipeline.run_after_iteration(&mut ctx).await.unwrap();
        drop(ctx);

        let events = drainer.flush().await;
        assert!(matches!(
            &events[0].kind,
            EventKind::MessagesSnapshot { messages } if messages.len() == 1
        ));
    }
}
