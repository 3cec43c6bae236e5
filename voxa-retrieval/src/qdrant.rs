//! Qdrant-backed vector search for context chunks.
//!
//! Uses Qdrant for cosine similarity search over the knowledge collection.
//! Requires a running Qdrant instance.

use crate::traits::{ContextChunk, KnowledgeChunk, RetrievalError, RetrievalResult, VectorSearch};
use async_trait::async_trait;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, Distance, Filter, PointId, PointStruct,
    SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// One-shot collection existence check, shared by all requests on a store.
///
/// The check runs once per store instance and its result is cached with no
/// invalidation: if the collection is deleted out-of-band the cache goes
/// stale until [`CollectionBootstrap::reset`] is called. Tests use `reset`
/// to force a re-check.
#[derive(Default)]
pub struct CollectionBootstrap {
    checked: AtomicBool,
    guard: Mutex<()>,
}

impl CollectionBootstrap {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the collection has been verified or created.
    pub fn is_ready(&self) -> bool {
        self.checked.load(Ordering::Acquire)
    }

    /// Drop the cached check result so the next request re-verifies.
    pub fn reset(&self) {
        self.checked.store(false, Ordering::Release);
    }

    fn mark_ready(&self) {
        self.checked.store(true, Ordering::Release);
    }
}

/// Payload stored with each Qdrant point.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkPayload {
    document_id: String,
    chunk_index: u64,
    chunk_id: String,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_file: Option<String>,
}

/// Qdrant-backed context store with cosine similarity search.
pub struct QdrantContextStore {
    client: Qdrant,
    collection: String,
    dimension: usize,
    bootstrap: CollectionBootstrap,
}

impl QdrantContextStore {
    /// Connect to a Qdrant instance.
    ///
    /// # Arguments
    /// * `url` - Qdrant server URL (e.g., "http://localhost:6334")
    /// * `collection` - Name of the knowledge collection
    /// * `dimension` - Vector width of the collection
    pub fn connect(url: &str, collection: &str, dimension: usize) -> RetrievalResult<Self> {
        if dimension == 0 {
            return Err(RetrievalError::Store(
                "collection width must be non-zero".into(),
            ));
        }

        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| RetrievalError::Store(format!("connect failed: {e}")))?;

        Ok(Self {
            client,
            collection: collection.to_string(),
            dimension,
            bootstrap: CollectionBootstrap::new(),
        })
    }

    /// Access the bootstrap cell (test hook for cache invalidation).
    pub fn bootstrap(&self) -> &CollectionBootstrap {
        &self.bootstrap
    }

    /// Convert a chunk id to a deterministic point ID.
    fn chunk_point_id(chunk_id: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        chunk_id.hash(&mut hasher);
        hasher.finish()
    }

    fn create_point(payload: &ChunkPayload, vector: Vec<f32>) -> PointStruct {
        let id = Self::chunk_point_id(&payload.chunk_id);

        let fields = serde_json::to_value(payload)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();

        PointStruct::new(
            PointId::from(id),
            vector,
            fields
                .into_iter()
                .map(|(k, v)| (k, qdrant_value_from_json(v)))
                .collect::<std::collections::HashMap<_, _>>(),
        )
    }

    /// Extract a chunk from a Qdrant point payload.
    fn extract_chunk(
        payload: &std::collections::HashMap<String, qdrant_client::qdrant::Value>,
        score: f32,
    ) -> Option<ContextChunk> {
        let document_id = payload.get("document_id")?.as_str()?.to_string();
        let chunk_index = payload.get("chunk_index")?.as_integer()? as u64;
        let chunk_id = payload.get("chunk_id")?.as_str()?.to_string();
        let text = payload.get("text")?.as_str()?.to_string();
        let category = payload
            .get("category")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let source_file = payload
            .get("source_file")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Some(ContextChunk {
            document_id,
            chunk_index,
            chunk_id,
            text,
            category,
            source_file,
            score,
        })
    }

    async fn search_points(
        &self,
        vector: Vec<f32>,
        limit: u64,
        category: Option<&str>,
    ) -> RetrievalResult<Vec<ContextChunk>> {
        let mut builder =
            SearchPointsBuilder::new(&self.collection, vector, limit).with_payload(true);

        if let Some(cat) = category {
            builder = builder.filter(Filter::must([Condition::matches(
                "category",
                cat.to_string(),
            )]));
        }

        let results = self
            .client
            .search_points(builder)
            .await
            .map_err(|e| RetrievalError::Store(format!("search failed: {e}")))?;

        Ok(results
            .result
            .iter()
            .filter_map(|point| Self::extract_chunk(&point.payload, point.score))
            .collect())
    }
}

/// Convert JSON value to Qdrant value.
fn qdrant_value_from_json(json: serde_json::Value) -> qdrant_client::qdrant::Value {
    use qdrant_client::qdrant::value::Kind;
    use qdrant_client::qdrant::Value;

    match json {
        serde_json::Value::Null => Value {
            kind: Some(Kind::NullValue(0)),
        },
        serde_json::Value::Bool(b) => Value {
            kind: Some(Kind::BoolValue(b)),
        },
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value {
                    kind: Some(Kind::IntegerValue(i)),
                }
            } else if let Some(f) = n.as_f64() {
                Value {
                    kind: Some(Kind::DoubleValue(f)),
                }
            } else {
                Value {
                    kind: Some(Kind::StringValue(n.to_string())),
                }
            }
        }
        serde_json::Value::String(s) => Value {
            kind: Some(Kind::StringValue(s)),
        },
        serde_json::Value::Array(arr) => {
            use qdrant_client::qdrant::ListValue;
            let values: Vec<Value> = arr.into_iter().map(qdrant_value_from_json).collect();
            Value {
                kind: Some(Kind::ListValue(ListValue { values })),
            }
        }
        serde_json::Value::Object(obj) => {
            use qdrant_client::qdrant::Struct;
            let fields: std::collections::HashMap<String, Value> = obj
                .into_iter()
                .map(|(k, v)| (k, qdrant_value_from_json(v)))
                .collect();
            Value {
                kind: Some(Kind::StructValue(Struct { fields })),
            }
        }
    }
}

#[async_trait]
impl VectorSearch for QdrantContextStore {
    fn name(&self) -> &str {
        "qdrant"
    }

    async fn ensure_ready(&self) -> RetrievalResult<()> {
        if self.bootstrap.is_ready() {
            return Ok(());
        }

        // Serialize concurrent first requests so the collection is created once.
        let _guard = self.bootstrap.guard.lock().await;
        if self.bootstrap.is_ready() {
            return Ok(());
        }

        let collections = self
            .client
            .list_collections()
            .await
            .map_err(|e| RetrievalError::Store(format!("list collections failed: {e}")))?;
        let exists = collections
            .collections
            .iter()
            .any(|c| c.name == self.collection);

        if !exists {
            tracing::info!(
                collection = %self.collection,
                dimension = self.dimension,
                "Creating Qdrant collection"
            );

            let vector_params =
                VectorParamsBuilder::new(self.dimension as u64, Distance::Cosine);

            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection).vectors_config(vector_params),
                )
                .await
                .map_err(|e| RetrievalError::Store(format!("create collection failed: {e}")))?;
        }

        self.bootstrap.mark_ready();
        Ok(())
    }

    async fn search(
        &self,
        vector: Vec<f32>,
        limit: u64,
        category: Option<&str>,
    ) -> RetrievalResult<Vec<ContextChunk>> {
        self.ensure_ready().await?;

        match self.search_points(vector.clone(), limit, category).await {
            Ok(chunks) => Ok(chunks),
            // A filtered query against a collection with no payload index for
            // the filter field fails; degrade to an unfiltered query rather
            // than failing the whole request.
            Err(e) if category.is_some() && e.to_string().to_lowercase().contains("index") => {
                tracing::warn!(
                    collection = %self.collection,
                    error = %e,
                    "Category filter unsupported, retrying unfiltered"
                );
                self.search_points(vector, limit, None).await
            }
            Err(e) => Err(e),
        }
    }

    /// Points carry {document_id, chunk_index, chunk_id, text, category,
    /// source_file}; point ids are deterministic so re-ingesting a document
    /// overwrites rather than duplicates.
    async fn upsert(
        &self,
        document_id: &str,
        source_file: Option<&str>,
        chunks: Vec<(KnowledgeChunk, Vec<f32>)>,
    ) -> RetrievalResult<usize> {
        self.ensure_ready().await?;

        let points: Vec<PointStruct> = chunks
            .into_iter()
            .enumerate()
            .map(|(index, (chunk, vector))| {
                let payload = ChunkPayload {
                    document_id: document_id.to_string(),
                    chunk_index: index as u64,
                    chunk_id: format!("{document_id}#{index}"),
                    text: chunk.text,
                    category: chunk.category,
                    source_file: source_file.map(|s| s.to_string()),
                };
                Self::create_point(&payload, vector)
            })
            .collect();

        let written = points.len();
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await
            .map_err(|e| RetrievalError::Store(format!("upsert failed: {e}")))?;

        tracing::debug!(
            document_id = document_id,
            collection = %self.collection,
            points = written,
            "Ingested document chunks"
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_id_deterministic() {
        let id1 = QdrantContextStore::chunk_point_id("handbook#0");
        let id2 = QdrantContextStore::chunk_point_id("handbook#0");
        assert_eq!(id1, id2);
    }

    #[test]
    fn point_id_differs_per_chunk() {
        let id1 = QdrantContextStore::chunk_point_id("handbook#0");
        let id2 = QdrantContextStore::chunk_point_id("handbook#1");
        assert_ne!(id1, id2);
    }

    #[test]
    fn bootstrap_reset_clears_check() {
        let bootstrap = CollectionBootstrap::new();
        assert!(!bootstrap.is_ready());
        bootstrap.mark_ready();
        assert!(bootstrap.is_ready());
        bootstrap.reset();
        assert!(!bootstrap.is_ready());
    }

    #[test]
    fn zero_width_store_rejected() {
        let result = QdrantContextStore::connect("http://localhost:6334", "test", 0);
        assert!(result.is_err());
        let message = result.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(message.contains("non-zero"));
    }

    #[test]
    fn payload_round_trip() {
        let payload = ChunkPayload {
            document_id: "doc".into(),
            chunk_index: 3,
            chunk_id: "doc#3".into(),
            text: "body".into(),
            category: Some("fees".into()),
            source_file: None,
        };
        let json = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(json["chunk_id"], "doc#3");
        // Skipped optionals stay out of the payload
        assert!(json.get("source_file").is_none());
    }

    #[test]
    fn qdrant_value_from_json_string() {
        let val = qdrant_value_from_json(serde_json::json!("hello"));
        assert!(matches!(
            val.kind,
            Some(qdrant_client::qdrant::value::Kind::StringValue(s)) if s == "hello"
        ));
    }

    #[test]
    fn qdrant_value_from_json_number() {
        let val = qdrant_value_from_json(serde_json::json!(42));
        assert!(matches!(
            val.kind,
            Some(qdrant_client::qdrant::value::Kind::IntegerValue(42))
        ));
    }

    #[tokio::test]
    #[ignore = "requires Qdrant"]
    async fn ingest_and_search() {
        let store =
            QdrantContextStore::connect("http://localhost:6334", "voxa_test", 4).expect("connect");
        store.bootstrap().reset();

        let chunks = vec![
            (
                KnowledgeChunk {
                    text: "Tuition for the engineering program is 120000 per year".into(),
                    category: Some("fees".into()),
                },
                vec![1.0, 0.0, 0.0, 0.0],
            ),
            (
                KnowledgeChunk {
                    text: "The library is open from 8am to midnight".into(),
                    category: Some("campus".into()),
                },
                vec![0.0, 1.0, 0.0, 0.0],
            ),
        ];

        let written = store
            .upsert("handbook", Some("handbook.pdf"), chunks)
            .await
            .expect("upsert");
        assert_eq!(written, 2);

        let hits = store
            .search(vec![0.9, 0.1, 0.0, 0.0], 1, None)
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("Tuition"));
        assert_eq!(hits[0].document_id, "handbook");
    }

    #[tokio::test]
    #[ignore = "requires Qdrant"]
    async fn filtered_search_degrades_without_index() {
        let store =
            QdrantContextStore::connect("http://localhost:6334", "voxa_test", 4).expect("connect");

        // No payload index exists for "category" on a fresh collection, so
        // the filtered query must fall back to unfiltered rather than error.
        let hits = store
            .search(vec![1.0, 0.0, 0.0, 0.0], 2, Some("fees"))
            .await
            .expect("search should degrade, not fail");
        assert!(hits.len() <= 2);
    }
}
