use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which tools are offered to the provider on each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSelection {
    /// Every registered tool, every iteration.
    All,
    /// Vector-similarity selection against recent conversation text.
    Contextual,
}

/// What to do when tool selection cannot produce a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionFallback {
    /// Expose all registered tools.
    UseAll,
    /// Expose no tools.
    UseNone,
    /// Propagate the failure and end the turn.
    Fail,
}

impl SelectionFallback {
    pub fn name(&self) -> &'static str {
        match self {
            SelectionFallback::UseAll => "use_all",
            SelectionFallback::UseNone => "use_none",
            SelectionFallback::Fail => "fail",
        }
    }
}

/// Exponential backoff policy for retryable provider errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

/// Per-turn agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOptions {
    /// Hard cap on LLM calls per turn.
    pub max_iterations: usize,
    /// Extra iterations granted per continuation approval.
    pub continuation_extension: usize,
    /// Batch size at which the scheduler switches from sequential to
    /// concurrent tool execution.
    pub parallel_tool_threshold: usize,
    pub tool_selection: ToolSelection,
    pub fallback_on_selection_failure: SelectionFallback,
    pub fallback_on_vector_store_failure: SelectionFallback,
    /// Minimum similarity score for a tool to be selected, in [0, 1].
    pub similarity_threshold: f32,
    pub max_relevant_tools: usize,
    /// How many recent non-system messages feed the selection query.
    pub recent_message_window: usize,
    /// Deadline for interactive request/response waits (permission prompts).
    pub operation_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// System instructions sent with every provider call. Iteration
    /// middleware may rewrite this between iterations.
    pub instructions: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            continuation_extension: 3,
            parallel_tool_threshold: 2,
            tool_selection: ToolSelection::All,
            fallback_on_selection_failure: SelectionFallback::UseAll,
            fallback_on_vector_store_failure: SelectionFallback::UseAll,
            similarity_threshold: 0.7,
            max_relevant_tools: 5,
            recent_message_window: 3,
            operation_timeout: Duration::from_secs(60),
            retry_policy: RetryPolicy::default(),
            instructions: None,
            temperature: 0.0,
            max_tokens: 4096,
        }
    }
}

impl AgentOptions {
    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_continuation_extension(mut self, extension: usize) -> Self {
        self.continuation_extension = extension;
        self
    }

    pub fn with_tool_selection(mut self, selection: ToolSelection) -> Self {
        self.tool_selection = selection;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}
