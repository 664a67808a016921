pub mod embedding;
pub mod pgvector;
pub mod vector;

pub use embedding::{Embedder, EmbeddingError, HashEmbedder, OpenAiEmbedder};
pub use pgvector::PgVectorStore;
pub use vector::{InMemoryVectorStore, ScoredHit, VectorStore, VectorStoreError};

use gantry_core::coordinator::TurnCoordinator;
use gantry_core::event::EventKind;
use gantry_core::message::{Message, Role};
use gantry_core::options::{AgentOptions, SelectionFallback};
use gantry_tool_runtime::registry::ToolRegistry;
use gantry_tool_runtime::tool::ToolDefinition;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("vector store failure: {0}")]
    Store(#[from] VectorStoreError),

    #[error("selection produced no usable query")]
    EmptyQuery,

    #[error("no tools matched the selection query")]
    NoMatch,
}

/// Clips the selection query before it reaches the vector store.
pub trait TruncationStrategy: Send + Sync {
    fn truncate(&self, text: &str) -> String;
}

/// Character-budget truncation keeping the most recent text. The budget is
/// a token approximation at roughly four characters per token.
pub struct CharBudget {
    pub max_chars: usize,
}

impl CharBudget {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Default for CharBudget {
    fn default() -> Self {
        // ~500 tokens of context.
        Self::new(2000)
    }
}

impl TruncationStrategy for CharBudget {
    fn truncate(&self, text: &str) -> String {
        if text.len() <= self.max_chars {
            return text.to_string();
        }
        // Keep the tail: the most recent conversation wins.
        let mut start = text.len() - self.max_chars;
        while !text.is_char_boundary(start) {
            start += 1;
        }
        text[start..].to_string()
    }
}

/// Narrows the tool set per iteration by vector similarity against recent
/// conversation text. The index is built once per selector lifetime and
/// shared across turns.
pub struct ToolSelector {
    store: Arc<dyn VectorStore>,
    truncation: Box<dyn TruncationStrategy>,
}

impl ToolSelector {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self {
            store,
            truncation: Box::new(CharBudget::default()),
        }
    }

    pub fn with_truncation(mut self, truncation: Box<dyn TruncationStrategy>) -> Self {
        self.truncation = truncation;
        self
    }

    /// Ingest a description document for every registered tool, keyed by
    /// tool name. Call once before the first turn.
    pub async fn index_tools(&self, registry: &ToolRegistry) -> Result<(), VectorStoreError> {
        for definition in registry.list() {
            let document = tool_document(&definition);
            self.store.ingest(&definition.name, &document).await?;
        }
        debug!(tools = registry.len(), "indexed tool descriptions");
        Ok(())
    }

    /// Pick the tools to expose this iteration. Store failures and empty
    /// queries apply the configured fallback policies; fallback application
    /// is announced with a `filter_error` event, successful selection with
    /// `filter_progress`.
    pub async fn select(
        &self,
        messages: &[Message],
        registry: &ToolRegistry,
        options: &AgentOptions,
        coordinator: &Arc<TurnCoordinator>,
    ) -> Result<Vec<ToolDefinition>, SelectorError> {
        let total = registry.len();
        let query = self.build_query(messages, options);
        if query.is_empty() {
            return self.fallback(
                options.fallback_on_vector_store_failure,
                "selection query is empty",
                registry,
                coordinator,
                SelectorError::EmptyQuery,
            );
        }

        match self
            .store
            .search(&query, options.max_relevant_tools, options.similarity_threshold)
            .await
        {
            Ok(hits) => {
                // Preserve the store's ordering; drop ids no longer in the
                // registry (stale after tool deregistration).
                let selected: Vec<ToolDefinition> = hits
                    .iter()
                    .filter_map(|hit| registry.get(&hit.id).map(|tool| tool.definition()))
                    .collect();

                if selected.is_empty() && total > 0 {
                    return self.fallback(
                        options.fallback_on_selection_failure,
                        "no tools above the similarity threshold",
                        registry,
                        coordinator,
                        SelectorError::NoMatch,
                    );
                }

                debug!(selected = selected.len(), total, "tool selection complete");
                coordinator.emit(EventKind::FilterProgress {
                    selected: selected.len(),
                    total,
                });
                Ok(selected)
            }
            Err(err) => {
                let message = err.to_string();
                self.fallback(
                    options.fallback_on_vector_store_failure,
                    &message,
                    registry,
                    coordinator,
                    SelectorError::Store(err),
                )
            }
        }
    }

    fn fallback(
        &self,
        policy: SelectionFallback,
        message: &str,
        registry: &ToolRegistry,
        coordinator: &Arc<TurnCoordinator>,
        error: SelectorError,
    ) -> Result<Vec<ToolDefinition>, SelectorError> {
        warn!(%message, policy = policy.name(), "tool selection fell back");
        coordinator.emit(EventKind::FilterError {
            message: message.to_string(),
            fallback: policy.name().to_string(),
        });
        match policy {
            SelectionFallback::UseAll => Ok(registry.list()),
            SelectionFallback::UseNone => Ok(Vec::new()),
            SelectionFallback::Fail => Err(error),
        }
    }

    /// Concatenate the text of the last `recent_message_window` non-system
    /// messages with non-empty text, oldest first, then clip.
    fn build_query(&self, messages: &[Message], options: &AgentOptions) -> String {
        let mut texts: Vec<String> = messages
            .iter()
            .rev()
            .filter(|m| m.role != Role::System)
            .map(|m| m.text())
            .filter(|t| !t.trim().is_empty())
            .take(options.recent_message_window)
            .collect();
        texts.reverse();
        self.truncation.truncate(&texts.join("\n"))
    }
}

/// Description document ingested per tool.
fn tool_document(definition: &ToolDefinition) -> String {
    let mut doc = format!(
        "Function: {}\nDescription: {}\nParameters:\n",
        definition.name, definition.description
    );
    if let Some(properties) = definition
        .input_schema
        .get("properties")
        .and_then(|p| p.as_object())
    {
        for (name, schema) in properties {
            let description = schema
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or("");
            doc.push_str(&format!("- {}: {}\n", name, description));
        }
    }
    doc
}
