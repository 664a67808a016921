pub mod iteration;
pub mod runtime;
pub mod selector;
pub mod thread;

pub use iteration::{
    IterationContext, IterationMiddleware, IterationPipeline, MessagesSnapshotMiddleware,
};
pub use runtime::{AgentError, AgentLoop, CONTINUATION_TIMEOUT, SKIP_NEXT_LLM_CALL};
pub use selector::{ToolSelector, TruncationStrategy};
pub use thread::{InMemoryThread, Thread};
