//! Context retrieval for the Voxa voice agent.
//!
//! Turns an utterance into a relevance-gated knowledge snippet: embed the
//! text, search the vector store by cosine similarity, and let the caller
//! apply the strict relevance gate. A prewarm path hides retrieval latency
//! by running speculative queries while the user is still speaking.

pub mod embeddings;
pub mod qdrant;
pub mod routes;
pub mod service;
pub mod traits;

pub use embeddings::{pad_to_dimension, HttpEmbedding, NoopEmbedding};
pub use qdrant::{CollectionBootstrap, QdrantContextStore};
pub use routes::{retrieval_router, RetrievalState};
pub use service::{gate_context, ContextService, PrewarmKey};
pub use traits::{ContextChunk, EmbeddingProvider, KnowledgeChunk, RetrievalError, VectorSearch};
