//! Core retrieval traits and types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result type for retrieval operations.
pub type RetrievalResult<T> = Result<T, RetrievalError>;

/// Retrieval error type.
///
/// Every variant is non-fatal to a live conversation: callers degrade to
/// "no context" instead of aborting.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Vector store error: {0}")]
    Store(String),

    #[error("Embedding width {actual} exceeds collection width {target}")]
    BadDimension { actual: usize, target: usize },

    #[error("Retrieval timed out")]
    Timeout,

    #[error("Retrieval cancelled")]
    Cancelled,
}

/// A retrieved unit of knowledge with its similarity to the query.
///
/// Produced per query, never mutated, discarded after injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextChunk {
    /// Originating document identifier.
    pub document_id: String,
    /// Position of this chunk within the document.
    pub chunk_index: u64,
    /// Composite id, `{document_id}#{chunk_index}`.
    pub chunk_id: String,
    /// The chunk text.
    pub text: String,
    /// Optional category the chunk was filed under.
    pub category: Option<String>,
    /// Optional source file the document came from.
    pub source_file: Option<String>,
    /// Cosine similarity to the query, 0.0-1.0.
    pub score: f32,
}

/// A chunk to be ingested into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub text: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// Trait for embedding providers — text in, fixed-width vector out.
///
/// Instances are process-wide: initialized once and safe for concurrent
/// read-only use by overlapping requests.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name (e.g., "http", "noop")
    fn name(&self) -> &str;

    /// Native output width of the model.
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts.
    async fn embed(&self, texts: &[&str]) -> RetrievalResult<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> RetrievalResult<Vec<f32>> {
        let mut vectors = self.embed(&[text]).await?;
        vectors
            .pop()
            .ok_or_else(|| RetrievalError::Embedding("provider returned no vector".into()))
    }
}

/// Trait for vector store backends.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Backend name (e.g., "qdrant")
    fn name(&self) -> &str;

    /// Make sure the collection exists with the configured width and
    /// cosine distance. Checked once per store instance; see
    /// [`crate::qdrant::CollectionBootstrap`].
    async fn ensure_ready(&self) -> RetrievalResult<()>;

    /// Return the `limit` nearest chunks by cosine similarity, ordered by
    /// descending score, optionally filtered by category.
    async fn search(
        &self,
        vector: Vec<f32>,
        limit: u64,
        category: Option<&str>,
    ) -> RetrievalResult<Vec<ContextChunk>>;

    /// Ingest chunks with their pre-computed vectors. Returns the number of
    /// points written. Callers embed (and pad) before upserting.
    async fn upsert(
        &self,
        document_id: &str,
        source_file: Option<&str>,
        chunks: Vec<(KnowledgeChunk, Vec<f32>)>,
    ) -> RetrievalResult<usize>;
}
