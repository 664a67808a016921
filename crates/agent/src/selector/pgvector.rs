use super::embedding::Embedder;
use super::vector::{ScoredHit, VectorStore, VectorStoreError};
use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{PgPool, Row};
use std::sync::Arc;

/// Postgres/pgvector-backed store for tool-description vectors.
///
/// Expects an existing table:
///
/// ```sql
/// CREATE TABLE tool_vectors (
///     id        TEXT PRIMARY KEY,
///     content   TEXT NOT NULL,
///     embedding vector(N) NOT NULL
/// );
/// ```
///
/// where `N` matches the embedder's dimensionality.
pub struct PgVectorStore {
    pool: PgPool,
    embedder: Arc<dyn Embedder>,
    table: String,
}

impl PgVectorStore {
    pub fn new(pool: PgPool, embedder: Arc<dyn Embedder>) -> Self {
        Self::with_table(pool, embedder, "tool_vectors")
    }

    pub fn with_table(pool: PgPool, embedder: Arc<dyn Embedder>, table: &str) -> Self {
        Self {
            pool,
            embedder,
            table: table.to_string(),
        }
    }

    async fn embed(&self, text: &str) -> Result<Vector, VectorStoreError> {
        let embedding = self
            .embedder
            .embed_batch(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| VectorStoreError::Backend("embedder returned no vector".to_string()))?;
        Ok(Vector::from(embedding))
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn ingest(&self, id: &str, text: &str) -> Result<(), VectorStoreError> {
        let embedding = self.embed(text).await?;
        let sql = format!(
            "INSERT INTO {} (id, content, embedding) VALUES ($1, $2, $3) \
             ON CONFLICT (id) DO UPDATE SET content = EXCLUDED.content, \
             embedding = EXCLUDED.embedding",
            self.table
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(text)
            .bind(&embedding)
            .execute(&self.pool)
            .await
            .map_err(|e| VectorStoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredHit>, VectorStoreError> {
        let embedding = self.embed(query).await?;
        let sql = format!(
            "SELECT id, 1.0 - (embedding <=> $1::vector) AS similarity \
             FROM {} ORDER BY embedding <=> $1::vector LIMIT $2",
            self.table
        );
        let rows = sqlx::query(&sql)
            .bind(&embedding)
            .bind(k as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VectorStoreError::Backend(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| ScoredHit {
                id: row.get("id"),
                score: (row.get::<f64, _>("similarity") as f32).max(0.0),
            })
            .filter(|hit| hit.score >= min_score)
            .collect())
    }
}
