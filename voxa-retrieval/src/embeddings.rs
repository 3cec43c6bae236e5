//! Embedding providers.
//!
//! The production provider calls an OpenAI-compatible `/v1/embeddings`
//! endpoint on a local inference server (Ollama, llama.cpp server, or any
//! compatible host). Vectors narrower than the collection width are
//! zero-padded and renormalized before search.

use crate::traits::{EmbeddingProvider, RetrievalError, RetrievalResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Pad a vector up to `target` width without changing its direction.
///
/// The native values are copied into a zero vector and rescaled so the
/// padded vector has unit L2 norm; the tail stays zero. A vector already
/// at `target` width is returned unchanged.
pub fn pad_to_dimension(vector: &[f32], target: usize) -> RetrievalResult<Vec<f32>> {
    if vector.len() > target {
        return Err(RetrievalError::BadDimension {
            actual: vector.len(),
            target,
        });
    }
    if vector.len() == target {
        return Ok(vector.to_vec());
    }

    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mut padded = vec![0.0f32; target];
    if norm > 0.0 {
        for (slot, value) in padded.iter_mut().zip(vector.iter()) {
            *slot = value / norm;
        }
    } else {
        padded[..vector.len()].copy_from_slice(vector);
    }
    Ok(padded)
}

/// Embedding provider backed by an OpenAI-compatible HTTP endpoint.
pub struct HttpEmbedding {
    client: Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl HttpEmbedding {
    /// Create a new HTTP embedding provider.
    ///
    /// # Arguments
    /// * `base_url` - Server base URL (e.g., "http://localhost:11434")
    /// * `model` - Embedding model name
    /// * `dimensions` - Native output width of the model
    /// * `timeout` - Per-request bound
    pub fn new(base_url: &str, model: String, dimensions: usize, timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(2))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedding {
    fn name(&self) -> &str {
        "http"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[&str]) -> RetrievalResult<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RetrievalError::Timeout
                } else {
                    RetrievalError::Embedding(format!("request failed: {e}"))
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp.text().await.unwrap_or_default();
            return Err(RetrievalError::Embedding(format!(
                "server returned {status}: {detail}"
            )));
        }

        let parsed: EmbeddingsResponse = resp
            .json()
            .await
            .map_err(|e| RetrievalError::Embedding(format!("invalid response: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(RetrievalError::Embedding(format!(
                "expected {} vectors, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        let mut vectors = Vec::with_capacity(parsed.data.len());
        for data in parsed.data {
            if data.embedding.len() != self.dimensions {
                return Err(RetrievalError::Embedding(format!(
                    "model returned width {}, expected {}",
                    data.embedding.len(),
                    self.dimensions
                )));
            }
            vectors.push(data.embedding);
        }
        Ok(vectors)
    }
}

/// No-op embedding provider that returns empty vectors.
///
/// Useful as a placeholder where embeddings are not configured; a store
/// refuses to connect with it.
pub struct NoopEmbedding;

#[async_trait]
impl EmbeddingProvider for NoopEmbedding {
    fn name(&self) -> &str {
        "noop"
    }

    fn dimensions(&self) -> usize {
        0
    }

    async fn embed(&self, texts: &[&str]) -> RetrievalResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| Vec::new()).collect())
    }
}
