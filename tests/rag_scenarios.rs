//! Scenario 7: ingest a multi-thousand-character document into `tenant1/store1`, then retrieve
//! with `top_k=2` and a `thread_id` that was never used during ingest. The search call carries
//! the thread filter and the result list never exceeds `top_k`.

use airborne::airborne::rag::embedder::Embedder;
use airborne::airborne::rag::orchestrator::{ingest, retrieve, IngestParams, RetrieveParams};
use airborne::airborne::rag::vector_store::{CollectionInfo, Filter, Point, SearchResult, VectorStore};
use airborne::airborne::rag::chunker::ChunkParams;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

struct FakeEmbedder;

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, String> {
        Ok(vec![0.1, 0.2, 0.3])
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
    }
    fn dimensions(&self) -> usize {
        3
    }
    fn model(&self) -> &str {
        "fake"
    }
}

/// Records the filter passed to every `search` call, in addition to behaving like a real store.
#[derive(Default)]
struct RecordingStore {
    collections: Mutex<HashSet<String>>,
    points: Mutex<Vec<Point>>,
    search_filters: Mutex<Vec<Filter>>,
}

#[async_trait]
impl VectorStore for RecordingStore {
    async fn create_collection(&self, name: &str, _dims: usize) -> Result<(), String> {
        self.collections.lock().unwrap().insert(name.to_string());
        Ok(())
    }
    async fn delete_collection(&self, name: &str) -> Result<(), String> {
        self.collections.lock().unwrap().remove(name);
        Ok(())
    }
    async fn collection_exists(&self, name: &str) -> Result<bool, String> {
        Ok(self.collections.lock().unwrap().contains(name))
    }
    async fn collection_info(&self, _name: &str) -> Result<CollectionInfo, String> {
        Ok(CollectionInfo { point_count: 0, dimensions: 3 })
    }
    async fn upsert(&self, _name: &str, points: Vec<Point>) -> Result<(), String> {
        self.points.lock().unwrap().extend(points);
        Ok(())
    }
    async fn search(
        &self,
        _name: &str,
        _vector: &[f32],
        limit: usize,
        filter: &Filter,
        _score_threshold: Option<f32>,
    ) -> Result<Vec<SearchResult>, String> {
        self.search_filters.lock().unwrap().push(filter.clone());
        let points = self.points.lock().unwrap();
        let matches: Vec<SearchResult> = points
            .iter()
            .filter(|p| filter.equals.iter().all(|(k, v)| p.payload.get(k) == Some(v)))
            .take(limit)
            .map(|p| SearchResult { id: p.id.clone(), score: 0.9, payload: p.payload.clone() })
            .collect();
        Ok(matches)
    }
    async fn delete(&self, _name: &str, _ids: &[String]) -> Result<(), String> {
        Ok(())
    }
}

#[tokio::test]
async fn retrieval_with_an_unused_thread_id_honors_top_k_and_the_filter() {
    let embedder = FakeEmbedder;
    let store = RecordingStore::default();

    // A 6 000-character document, well past the default chunker's minimum, ingested without a
    // thread-id (mirrors an upload that happens outside any particular conversation thread).
    let document = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. ".repeat(106);
    assert!(document.len() >= 6_000);

    let outcome = ingest(
        IngestParams {
            tenant_id: "tenant1".to_string(),
            store_id: "store1".to_string(),
            thread_id: None,
            file_id: Some("doc-1".to_string()),
            filename: "doc.txt".to_string(),
            mime_type: "text/plain".to_string(),
            bytes: document.into_bytes(),
            conversion_service_url: None,
            chunk_params: ChunkParams::default(),
        },
        &embedder,
        &store,
    )
    .await
    .unwrap();
    assert!(outcome.chunks_ingested >= 1, "a multi-thousand-character document must produce at least one chunk");

    let results = retrieve(
        RetrieveParams {
            tenant_id: "tenant1".to_string(),
            store_id: "store1".to_string(),
            thread_id: Some("t".to_string()),
            query: "lorem ipsum".to_string(),
            top_k: 2,
        },
        &embedder,
        &store,
    )
    .await
    .unwrap();

    // Every chunk was ingested with no thread-id payload entry at all, so a search filtered on
    // thread-id="t" matches nothing — the filter itself is still what was sent to the store.
    assert!(results.len() <= 2);
    assert!(results.is_empty());

    let filters = store.search_filters.lock().unwrap();
    assert_eq!(filters.len(), 1);
    assert_eq!(filters[0].equals, vec![("thread_id".to_string(), serde_json::json!("t"))]);
}
