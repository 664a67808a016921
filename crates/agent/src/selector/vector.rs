use super::embedding::{Embedder, EmbeddingError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// One search hit: document id plus similarity score in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredHit {
    pub id: String,
    pub score: f32,
}

/// Vector index the tool selector consumes. Ingest happens at selector
/// init; `search` must be safe to call concurrently.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ingest(&self, id: &str, text: &str) -> Result<(), VectorStoreError>;

    /// Top-`k` hits scoring at least `min_score`, best first.
    async fn search(
        &self,
        query: &str,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredHit>, VectorStoreError>;
}

/// In-process cosine-similarity store over an embedder.
pub struct InMemoryVectorStore {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<Vec<(String, Vec<f32>)>>,
}

impl InMemoryVectorStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ingest(&self, id: &str, text: &str) -> Result<(), VectorStoreError> {
        let embedding = self
            .embedder
            .embed_batch(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| VectorStoreError::Backend("embedder returned no vector".to_string()))?;

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|(key, _)| key == id) {
            entry.1 = embedding;
        } else {
            entries.push((id.to_string(), embedding));
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredHit>, VectorStoreError> {
        let query_embedding = self
            .embedder
            .embed_batch(&[query])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| VectorStoreError::Backend("embedder returned no vector".to_string()))?;

        let entries = self.entries.read().await;
        let mut hits: Vec<ScoredHit> = entries
            .iter()
            .map(|(id, embedding)| ScoredHit {
                id: id.clone(),
                // Negative cosine means "unrelated" for selection purposes;
                // clamp into the documented [0, 1] range.
                score: cosine(&query_embedding, embedding).max(0.0),
            })
            .filter(|hit| hit.score >= min_score)
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
