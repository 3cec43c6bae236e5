//! The context retrieval service.
//!
//! Composes an embedding provider and a vector store into the single
//! `retrieve` primitive, and layers the prewarm path on top: speculative
//! retrieval keyed by (session, category, truncated query), with a single
//! in-flight prewarm per session and consume-once cache semantics.
//!
//! Relevance gating is deliberately NOT part of `retrieve` — callers apply
//! [`gate_context`] so the same primitive serves both the prewarm and the
//! final-answer paths.

use crate::embeddings::pad_to_dimension;
use crate::traits::{
    ContextChunk, EmbeddingProvider, KnowledgeChunk, RetrievalError, RetrievalResult, VectorSearch,
};
use dashmap::DashMap;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use voxa_common::config::RetrievalConfig;

/// Upper bound on memoized prewarm entries per session.
const PREWARM_SESSION_CAP: usize = 8;

/// Key for a memoized prewarm result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrewarmKey {
    session_id: String,
    category: Option<String>,
    query_head: String,
}

impl PrewarmKey {
    /// Leading slice of the utterance used for keying; partial and final
    /// utterances that share this prefix hit the same entry.
    const QUERY_HEAD_CHARS: usize = 64;

    pub fn new(session_id: &str, category: Option<&str>, query: &str) -> Self {
        let query_head: String = query
            .trim()
            .to_lowercase()
            .chars()
            .take(Self::QUERY_HEAD_CHARS)
            .collect();
        Self {
            session_id: session_id.to_string(),
            category: category.map(|s| s.to_string()),
            query_head,
        }
    }
}

struct Inner {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorSearch>,
    config: RetrievalConfig,
    cache: DashMap<PrewarmKey, Vec<ContextChunk>>,
    inflight: DashMap<String, oneshot::Sender<()>>,
}

/// Context retrieval with prewarm caching. Cheap to clone.
#[derive(Clone)]
pub struct ContextService {
    inner: Arc<Inner>,
}

impl ContextService {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorSearch>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                embedder,
                store,
                config,
                cache: DashMap::new(),
                inflight: DashMap::new(),
            }),
        }
    }

    /// Minimum top similarity for context injection.
    pub fn relevance_threshold(&self) -> f32 {
        self.inner.config.relevance_threshold
    }

    /// Default match count for the final-answer path.
    pub fn match_count(&self) -> u64 {
        self.inner.config.match_count
    }

    /// Retrieve the nearest chunks for a query, ordered by descending
    /// similarity. Bounded by the configured timeout; no relevance gating.
    pub async fn retrieve(
        &self,
        query: &str,
        match_count: u64,
        category: Option<&str>,
    ) -> RetrievalResult<Vec<ContextChunk>> {
        let deadline = Duration::from_millis(self.inner.config.timeout_ms);
        match tokio::time::timeout(deadline, self.retrieve_inner(query, match_count, category))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(RetrievalError::Timeout),
        }
    }

    async fn retrieve_inner(
        &self,
        query: &str,
        match_count: u64,
        category: Option<&str>,
    ) -> RetrievalResult<Vec<ContextChunk>> {
        let native = self.inner.embedder.embed_one(query).await?;
        let vector = pad_to_dimension(&native, self.inner.config.vector_dimension)?;
        let mut chunks = self.inner.store.search(vector, match_count, category).await?;
        chunks.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        Ok(chunks)
    }

    /// Retrieval for a live session: consult the prewarm cache first and
    /// consume a matching entry, skipping the network round trip entirely.
    pub async fn retrieve_for_session(
        &self,
        session_id: &str,
        query: &str,
        category: Option<&str>,
    ) -> RetrievalResult<Vec<ContextChunk>> {
        let key = PrewarmKey::new(session_id, category, query);
        if let Some((_, chunks)) = self.inner.cache.remove(&key) {
            tracing::debug!(
                session_id = session_id,
                "Prewarm hit, skipping retrieval round trip"
            );
            return Ok(chunks);
        }

        self.retrieve(query, self.inner.config.match_count, category)
            .await
    }

    /// Speculative retrieval while the user is still speaking.
    ///
    /// A newer prewarm for the same session cancels the in-flight one, so
    /// only the most recent result lands in the cache.
    pub fn prewarm(&self, session_id: &str, partial_query: &str, category: Option<&str>) {
        let partial = partial_query.trim();
        if partial.is_empty() {
            return;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        if let Some(previous) = self
            .inner
            .inflight
            .insert(session_id.to_string(), cancel_tx)
        {
            let _ = previous.send(());
        }

        let service = self.clone();
        let key = PrewarmKey::new(session_id, category, partial);
        let session = session_id.to_string();
        let query = partial.to_string();
        let category = category.map(|s| s.to_string());

        tokio::spawn(async move {
            let count = service.inner.config.prewarm_match_count;
            tokio::select! {
                _ = cancel_rx => {
                    tracing::debug!(session_id = %session, "Prewarm superseded, dropping result");
                }
                result = service.retrieve(&query, count, category.as_deref()) => {
                    match result {
                        Ok(chunks) if !chunks.is_empty() => {
                            service.store_prewarm(&session, key, chunks);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(session_id = %session, error = %e, "Prewarm failed");
                        }
                    }
                }
            }
        });
    }

    fn store_prewarm(&self, session_id: &str, key: PrewarmKey, chunks: Vec<ContextChunk>) {
        let held = self
            .inner
            .cache
            .iter()
            .filter(|entry| entry.key().session_id == session_id)
            .count();
        if held >= PREWARM_SESSION_CAP && !self.inner.cache.contains_key(&key) {
            tracing::debug!(
                session_id = session_id,
                cap = PREWARM_SESSION_CAP,
                "Prewarm cache full for session, dropping entry"
            );
            return;
        }
        self.inner.cache.insert(key, chunks);
    }

    /// Drop all prewarm state for a session: cached entries and any
    /// in-flight speculative request.
    pub fn clear_session(&self, session_id: &str) {
        if let Some((_, cancel)) = self.inner.inflight.remove(session_id) {
            let _ = cancel.send(());
        }
        self.inner
            .cache
            .retain(|key, _| key.session_id != session_id);
    }

    /// Embed and ingest document chunks into the store.
    pub async fn ingest(
        &self,
        document_id: &str,
        source_file: Option<&str>,
        chunks: Vec<KnowledgeChunk>,
    ) -> RetrievalResult<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let native = self.inner.embedder.embed(&texts).await?;
        if native.len() != chunks.len() {
            return Err(RetrievalError::Embedding(format!(
                "expected {} vectors, got {}",
                chunks.len(),
                native.len()
            )));
        }

        let mut embedded = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.into_iter().zip(native) {
            let padded = pad_to_dimension(&vector, self.inner.config.vector_dimension)?;
            embedded.push((chunk, padded));
        }

        self.inner.store.upsert(document_id, source_file, embedded).await
    }
}

/// The relevance gate: inject context if and only if the top similarity
/// clears the threshold.
///
/// Low-confidence context is actively suppressed rather than passed through;
/// with no context the backend falls back to its own redirection behavior.
pub fn gate_context(chunks: &[ContextChunk], threshold: f32) -> Option<String> {
    let top = chunks.first()?;
    if top.score < threshold {
        return None;
    }
    Some(
        chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"),
    )
}
