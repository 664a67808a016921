use crate::iteration::{IterationContext, IterationMiddleware, IterationPipeline};
use crate::selector::{SelectorError, ToolSelector};
use crate::thread::Thread;
use futures::{Future, StreamExt};
use gantry_core::coordinator::{CoordinatorError, EventDrainer, TurnCoordinator};
use gantry_core::event::{
    AgentEvent, ContinuationRequest, ContinuationResponse, EventKind, FinishedReason,
};
use gantry_core::message::{Message, ToolCall, ToolResult};
use gantry_core::options::{AgentOptions, ToolSelection};
use gantry_llm::{classify, retry_delay, ErrorClassification, ProviderFeatures};
use gantry_tool_runtime::middleware::FunctionPipeline;
use gantry_tool_runtime::provider::{ChatProvider, ChatRequest, ChatUpdate, LlmError};
use gantry_tool_runtime::registry::ToolRegistry;
use gantry_tool_runtime::scheduler::{ExecutionError, ToolScheduler};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Deadline for a continuation approval.
pub const CONTINUATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Property key an `after_iteration` hook sets (to `true`) to skip the
/// next iteration's LLM call.
pub const SKIP_NEXT_LLM_CALL: &str = "skip_next_llm_call";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("LLM error: {0}")]
    Provider(#[from] LlmError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("tool selection failed: {0}")]
    Selection(#[from] SelectorError),
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
    #[error("iteration middleware error: {0}")]
    Middleware(String),
    #[error("Event stream closed by receiver")]
    ChannelClosed,
}

/// The core agent loop: drives bounded iterations of LLM call → tool
/// execution, multiplexing provider deltas, middleware events and tool
/// results into one ordered event stream.
///
/// Flow: User → LLM → ToolCalls → Execute → Results → LLM → … → Final Text
pub struct AgentLoop {
    name: String,
    provider: Arc<dyn ChatProvider>,
    registry: Arc<ToolRegistry>,
    function_pipeline: Arc<FunctionPipeline>,
    iteration_pipeline: IterationPipeline,
    selector: Option<ToolSelector>,
    features: Option<Arc<dyn ProviderFeatures>>,
    options: AgentOptions,
}

impl AgentLoop {
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn ChatProvider>,
        registry: Arc<ToolRegistry>,
        options: AgentOptions,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            registry,
            function_pipeline: Arc::new(FunctionPipeline::new()),
            iteration_pipeline: IterationPipeline::new(),
            selector: None,
            features: None,
            options,
        }
    }

    pub fn with_function_pipeline(mut self, pipeline: Arc<FunctionPipeline>) -> Self {
        self.function_pipeline = pipeline;
        self
    }

    pub fn with_iteration_middleware(mut self, middleware: Arc<dyn IterationMiddleware>) -> Self {
        self.iteration_pipeline.register(middleware);
        self
    }

    pub fn with_selector(mut self, selector: ToolSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_provider_features(mut self, features: Arc<dyn ProviderFeatures>) -> Self {
        self.features = Some(features);
        self
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Run a single user turn with a turn-local coordinator. Callers that
    /// never answer request events (no interactive middleware, no
    /// continuations) can use this directly; otherwise create the
    /// coordinator yourself and use [`run_turn`](Self::run_turn) so you
    /// keep a handle for `send_response`.
    pub async fn run_streaming(
        &self,
        thread: &mut dyn Thread,
        user_message: String,
        tx: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Result<(), AgentError> {
        let (coordinator, drainer) = TurnCoordinator::new();
        self.run_turn(thread, user_message, tx, cancel, coordinator, drainer)
            .await
    }

    /// Run a single user turn, streaming events through `tx` as they
    /// happen. The stream always carries exactly one terminal event:
    /// `run_finished` or `run_error`, last.
    ///
    /// `coordinator` and `drainer` come from [`TurnCoordinator::new`] and
    /// are owned by this turn; the caller may keep a coordinator clone to
    /// route responses to request events.
    pub async fn run_turn(
        &self,
        thread: &mut dyn Thread,
        user_message: String,
        tx: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
        coordinator: Arc<TurnCoordinator>,
        mut drainer: EventDrainer,
    ) -> Result<(), AgentError> {
        // Configuration problems surface as a single run_error with no
        // events before it.
        if let Err(message) = self.validate() {
            self.send(
                &tx,
                EventKind::RunError {
                    message: message.clone(),
                    recoverable: false,
                },
            )
            .await?;
            return Err(AgentError::Configuration(message));
        }

        thread.append(Message::user(user_message));
        self.send(
            &tx,
            EventKind::RunStarted {
                agent: self.name.clone(),
            },
        )
        .await?;

        let turn = self
            .drive(thread, &coordinator, &mut drainer, &tx, &cancel)
            .await;

        // Teardown: resolve outstanding waiters, then flush everything the
        // channel still holds so the terminal event comes last.
        coordinator.shutdown();
        drop(coordinator);
        for event in drainer.flush().await {
            tx.send(event).await.map_err(|_| AgentError::ChannelClosed)?;
        }

        match turn {
            Ok(reason) => {
                info!(agent = %self.name, ?reason, "turn finished");
                self.send(&tx, EventKind::RunFinished { reason }).await?;
                Ok(())
            }
            Err(err) => {
                error!(agent = %self.name, error = %err, "turn failed");
                self.send(
                    &tx,
                    EventKind::RunError {
                        message: err.to_string(),
                        recoverable: false,
                    },
                )
                .await?;
                Err(err)
            }
        }
    }

    /// Convenience wrapper around [`run_streaming`](Self::run_streaming)
    /// that collects all events into a `Vec`.
    pub async fn run(
        &self,
        thread: &mut dyn Thread,
        user_message: String,
        cancel: CancellationToken,
    ) -> Result<Vec<AgentEvent>, AgentError> {
        let (tx, mut rx) = mpsc::channel(256);

        let collector = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        });

        let result = self.run_streaming(thread, user_message, tx, cancel).await;

        // tx is dropped here, so the collector finishes.
        let events = collector.await.expect("event collector task panicked");
        result.map(|_| events)
    }

    fn validate(&self) -> Result<(), String> {
        if self.options.tool_selection == ToolSelection::Contextual && self.selector.is_none() {
            return Err("contextual tool selection requires a selector".to_string());
        }
        if !(0.0..=1.0).contains(&self.options.similarity_threshold) {
            return Err(format!(
                "similarity threshold {} outside [0, 1]",
                self.options.similarity_threshold
            ));
        }
        Ok(())
    }

    /// The iteration state machine. Returns the finished reason; every
    /// error is caught by the caller and turned into `run_error`.
    async fn drive(
        &self,
        thread: &mut dyn Thread,
        coordinator: &Arc<TurnCoordinator>,
        drainer: &mut EventDrainer,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<FinishedReason, AgentError> {
        let scheduler = ToolScheduler::new(self.registry.clone(), self.function_pipeline.clone());
        let mut granted_extensions = 0usize;
        let mut properties: HashMap<String, Value> = HashMap::new();
        let mut index = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Ok(FinishedReason::Cancelled);
            }
            if index >= self.options.max_iterations + granted_extensions {
                return Ok(FinishedReason::IterationLimit);
            }

            self.drain_now(drainer, tx).await?;
            self.send(tx, EventKind::StepStarted { index }).await?;
            debug!(index, "starting iteration");

            let mut ctx = IterationContext::new(
                index,
                self.name.clone(),
                thread.snapshot(),
                self.options.clone(),
                coordinator.clone(),
            );
            ctx.properties = std::mem::take(&mut properties);
            ctx.skip_llm_call = ctx
                .properties
                .get(SKIP_NEXT_LLM_CALL)
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            self.iteration_pipeline.run_before_iteration(&mut ctx).await?;

            let assistant = if ctx.skip_llm_call {
                debug!(index, "LLM call skipped by middleware");
                Message::assistant(None, None, Vec::new())
            } else {
                match self
                    .call_provider(&ctx, coordinator, drainer, tx, cancel)
                    .await
                {
                    Ok(assistant) => assistant,
                    // A provider failure racing the caller's cancellation is
                    // reported as a cancelled turn, not an error.
                    Err(_) if cancel.is_cancelled() => return Ok(FinishedReason::Cancelled),
                    Err(err) => return Err(err),
                }
            };

            let tool_calls: Vec<ToolCall> =
                assistant.tool_calls().into_iter().cloned().collect();
            thread.append(assistant.clone());
            ctx.response = Some(assistant);
            ctx.tool_calls = tool_calls.clone();

            if cancel.is_cancelled() {
                return Ok(FinishedReason::Cancelled);
            }

            // No pending tool calls: the turn is complete.
            if tool_calls.is_empty() {
                ctx.messages = thread.snapshot();
                self.iteration_pipeline.run_after_iteration(&mut ctx).await?;
                self.drain_now(drainer, tx).await?;
                self.send(tx, EventKind::StepFinished { index }).await?;
                return Ok(FinishedReason::Completed);
            }

            self.iteration_pipeline
                .run_before_tool_execution(&mut ctx)
                .await?;
            self.drain_now(drainer, tx).await?;

            if ctx.skip_tool_execution {
                info!(index, calls = tool_calls.len(), "tool execution skipped by middleware");
                let results: Vec<ToolResult> = tool_calls
                    .iter()
                    .map(|call| ToolResult {
                        call_id: call.call_id.clone(),
                        content: "Tool call skipped".to_string(),
                        is_error: false,
                    })
                    .collect();
                for result in &results {
                    self.send_result(tx, result).await?;
                }
                thread.append(Message::tool(results.clone()));
                ctx.tool_results = results;
                ctx.messages = thread.snapshot();
                self.iteration_pipeline.run_after_iteration(&mut ctx).await?;
                self.drain_now(drainer, tx).await?;
                self.send(tx, EventKind::StepFinished { index }).await?;
                return Ok(FinishedReason::ToolsSkipped);
            }

            info!(index, count = tool_calls.len(), "executing tool calls");
            let outcome = forward_while(
                drainer,
                tx,
                scheduler.execute(&tool_calls, coordinator, &ctx.options, cancel),
            )
            .await?;
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(ExecutionError::Cancelled) => return Ok(FinishedReason::Cancelled),
                Err(fatal) => return Err(AgentError::Execution(fatal)),
            };

            self.drain_now(drainer, tx).await?;
            for result in &outcome.results {
                self.send_result(tx, result).await?;
            }
            ctx.tool_results = outcome.results.clone();
            thread.append(outcome.into_message());
            ctx.messages = thread.snapshot();

            self.iteration_pipeline.run_after_iteration(&mut ctx).await?;
            properties = std::mem::take(&mut ctx.properties);
            self.drain_now(drainer, tx).await?;
            self.send(tx, EventKind::StepFinished { index }).await?;

            if cancel.is_cancelled() {
                return Ok(FinishedReason::Cancelled);
            }

            // Budget edge with work still pending: ask for a continuation.
            let next = index + 1;
            if next >= self.options.max_iterations + granted_extensions {
                let granted = self
                    .request_continuation(
                        next,
                        self.options.max_iterations + granted_extensions,
                        coordinator,
                        drainer,
                        tx,
                        cancel,
                    )
                    .await?;
                if cancel.is_cancelled() {
                    return Ok(FinishedReason::Cancelled);
                }
                match granted {
                    Some(extensions) if extensions > 0 => {
                        info!(extensions, "continuation approved");
                        granted_extensions += extensions;
                    }
                    _ => return Ok(FinishedReason::IterationLimit),
                }
            }
            index = next;
        }
    }

    /// Narrow the tool set, open the provider stream (retrying per policy),
    /// and translate updates into events while accumulating the assistant
    /// message.
    async fn call_provider(
        &self,
        ctx: &IterationContext,
        coordinator: &Arc<TurnCoordinator>,
        drainer: &mut EventDrainer,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<Message, AgentError> {
        let tools = match ctx.options.tool_selection {
            ToolSelection::All => self.registry.list(),
            ToolSelection::Contextual => {
                let selector = self.selector.as_ref().ok_or_else(|| {
                    AgentError::Configuration("selector missing for contextual selection".into())
                })?;
                selector
                    .select(&ctx.messages, &self.registry, &ctx.options, coordinator)
                    .await?
            }
        };
        // Surface filter events before the first delta.
        self.drain_now(drainer, tx).await?;

        let request = ChatRequest {
            messages: ctx.messages.clone(),
            instructions: ctx.options.instructions.clone(),
            tools,
            temperature: ctx.options.temperature,
            max_tokens: ctx.options.max_tokens,
        };

        let mut attempt: u32 = 0;
        let mut stream = loop {
            match self.provider.stream_chat(request.clone(), cancel).await {
                Ok(stream) => break stream,
                Err(err) => {
                    let classification = self.classify(&err);
                    match retry_delay(&ctx.options.retry_policy, &classification, attempt) {
                        Some(delay) => {
                            warn!(attempt, ?delay, error = %err, "provider call failed, retrying");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = cancel.cancelled() => return Err(AgentError::Provider(err)),
                            }
                            attempt += 1;
                        }
                        None => return Err(AgentError::Provider(err)),
                    }
                }
            }
        };

        let mut text_parts: Vec<String> = Vec::new();
        let mut reasoning_parts: Vec<String> = Vec::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        // Calls under construction: (call_id, name, accumulated args JSON).
        let mut building: Vec<(String, String, String)> = Vec::new();
        let mut text_message_id: Option<String> = None;
        let mut reasoning_id: Option<String> = None;

        loop {
            let item = forward_while(drainer, tx, stream.next()).await?;
            let Some(item) = item else { break };
            let update = item.map_err(AgentError::Provider)?;

            match update {
                ChatUpdate::TextDelta { text } => {
                    self.close_reasoning(tx, &mut reasoning_id).await?;
                    if text_message_id.is_none() {
                        let id = Uuid::new_v4().to_string();
                        self.send(
                            tx,
                            EventKind::TextMessageStart {
                                message_id: id.clone(),
                            },
                        )
                        .await?;
                        text_message_id = Some(id);
                    }
                    let id = text_message_id.clone().expect("text message id set above");
                    self.send(
                        tx,
                        EventKind::TextMessageContent {
                            message_id: id,
                            delta: text.clone(),
                        },
                    )
                    .await?;
                    text_parts.push(text);
                }
                ChatUpdate::ReasoningDelta { text } => {
                    self.close_text(tx, &mut text_message_id).await?;
                    if reasoning_id.is_none() {
                        let id = Uuid::new_v4().to_string();
                        self.send(
                            tx,
                            EventKind::ReasoningStart {
                                message_id: id.clone(),
                            },
                        )
                        .await?;
                        reasoning_id = Some(id);
                    }
                    let id = reasoning_id.clone().expect("reasoning id set above");
                    self.send(
                        tx,
                        EventKind::ReasoningContent {
                            message_id: id,
                            delta: text.clone(),
                        },
                    )
                    .await?;
                    reasoning_parts.push(text);
                }
                ChatUpdate::ToolCallStart { call_id, name } => {
                    self.close_text(tx, &mut text_message_id).await?;
                    self.close_reasoning(tx, &mut reasoning_id).await?;
                    self.send(
                        tx,
                        EventKind::ToolCallStart {
                            call_id: call_id.clone(),
                            name: name.clone(),
                        },
                    )
                    .await?;
                    building.push((call_id, name, String::new()));
                }
                ChatUpdate::ToolCallArgsDelta { call_id, delta } => {
                    self.send(
                        tx,
                        EventKind::ToolCallArgsDelta {
                            call_id: call_id.clone(),
                            delta: delta.clone(),
                        },
                    )
                    .await?;
                    if let Some(entry) = building.iter_mut().find(|(id, _, _)| *id == call_id) {
                        entry.2.push_str(&delta);
                    }
                }
                ChatUpdate::ToolCallEnd { call_id } => {
                    self.send(
                        tx,
                        EventKind::ToolCallEnd {
                            call_id: call_id.clone(),
                        },
                    )
                    .await?;
                    if let Some(pos) = building.iter().position(|(id, _, _)| *id == call_id) {
                        let (id, name, args) = building.remove(pos);
                        let arguments = if args.trim().is_empty() {
                            Value::Object(Default::default())
                        } else {
                            serde_json::from_str(&args).unwrap_or_default()
                        };
                        tool_calls.push(ToolCall {
                            call_id: id,
                            name,
                            arguments,
                        });
                    }
                }
                ChatUpdate::Finish { reason } => {
                    debug!(?reason, "provider stream finished");
                }
            }
        }

        self.close_text(tx, &mut text_message_id).await?;
        self.close_reasoning(tx, &mut reasoning_id).await?;

        let text = if text_parts.is_empty() {
            None
        } else {
            Some(text_parts.join(""))
        };
        let reasoning = if reasoning_parts.is_empty() {
            None
        } else {
            Some(reasoning_parts.join(""))
        };
        Ok(Message::assistant(text, reasoning, tool_calls))
    }

    async fn close_text(
        &self,
        tx: &mpsc::Sender<AgentEvent>,
        text_message_id: &mut Option<String>,
    ) -> Result<(), AgentError> {
        if let Some(message_id) = text_message_id.take() {
            self.send(tx, EventKind::TextMessageEnd { message_id }).await?;
        }
        Ok(())
    }

    async fn close_reasoning(
        &self,
        tx: &mpsc::Sender<AgentEvent>,
        reasoning_id: &mut Option<String>,
    ) -> Result<(), AgentError> {
        if let Some(message_id) = reasoning_id.take() {
            self.send(tx, EventKind::ReasoningEnd { message_id }).await?;
        }
        Ok(())
    }

    /// Emit a continuation request and await the caller's decision.
    /// Returns the granted extension count (clipped to the configured
    /// maximum), or `None` on denial or timeout.
    async fn request_continuation(
        &self,
        iterations_used: usize,
        limit: usize,
        coordinator: &Arc<TurnCoordinator>,
        drainer: &mut EventDrainer,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>, AgentError> {
        let request_id = Uuid::new_v4().to_string();
        // Register before emitting so the reply cannot race the wait.
        let waiter = coordinator.register_waiter(&request_id);
        self.send(
            tx,
            EventKind::ContinuationRequest(ContinuationRequest {
                request_id: request_id.clone(),
                iterations_used,
                limit,
            }),
        )
        .await?;

        let decision = forward_while(
            drainer,
            tx,
            waiter.wait::<ContinuationResponse>(CONTINUATION_TIMEOUT, cancel),
        )
        .await?;

        match decision {
            Ok(response) if response.approved => Ok(Some(
                response.extensions.min(self.options.continuation_extension),
            )),
            Ok(_) => {
                debug!("continuation denied");
                Ok(None)
            }
            Err(CoordinatorError::Timeout { .. }) => {
                warn!("continuation request timed out");
                Ok(None)
            }
            Err(CoordinatorError::Cancelled { .. }) => Ok(None),
            Err(err) => Err(AgentError::Coordinator(err)),
        }
    }

    fn classify(&self, error: &LlmError) -> ErrorClassification {
        match &self.features {
            Some(features) => features.classify(error),
            None => classify(error),
        }
    }

    async fn drain_now(
        &self,
        drainer: &mut EventDrainer,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<(), AgentError> {
        while let Some(event) = drainer.try_next() {
            tx.send(event).await.map_err(|_| AgentError::ChannelClosed)?;
        }
        Ok(())
    }

    async fn send(&self, tx: &mpsc::Sender<AgentEvent>, kind: EventKind) -> Result<(), AgentError> {
        tx.send(AgentEvent::now(kind))
            .await
            .map_err(|_| AgentError::ChannelClosed)
    }

    async fn send_result(
        &self,
        tx: &mpsc::Sender<AgentEvent>,
        result: &ToolResult,
    ) -> Result<(), AgentError> {
        self.send(
            tx,
            EventKind::ToolResult {
                call_id: result.call_id.clone(),
                content: result.content.clone(),
                is_error: result.is_error,
            },
        )
        .await
    }
}

/// Await `fut` while forwarding any middleware events the drainer yields in
/// the meantime, so request events reach the caller even when the loop is
/// blocked on tool execution or a response wait.
async fn forward_while<F: Future>(
    drainer: &mut EventDrainer,
    tx: &mpsc::Sender<AgentEvent>,
    fut: F,
) -> Result<F::Output, AgentError> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Ok(out),
            maybe = drainer.recv() => match maybe {
                Some(event) => {
                    tx.send(event).await.map_err(|_| AgentError::ChannelClosed)?;
                }
                // Drainer already stopped; just finish the work.
                None => return Ok(fut.await),
            }
        }
    }
}
