//! Ingest/Retrieve orchestration (§4.10): ties chunker + embedder + vector store + extractor
//! together behind the two operations the chat orchestrator (C12) calls into.

use super::chunker::{chunk_text, ChunkParams};
use super::embedder::Embedder;
use super::extractor::extract;
use super::vector_store::{Filter, Point, VectorStore};
use crate::airborne::errors::GatewayError;
use serde_json::json;

/// Collection and store/identifier names share the `[A-Za-z0-9][A-Za-z0-9_-]*`, ≤128-char
/// pattern used for tenant IDs (§3).
pub fn is_valid_identifier(s: &str) -> bool {
    if s.is_empty() || s.len() > 128 {
        return false;
    }
    let mut chars = s.chars();
    let first_ok = chars.next().map(|c| c.is_ascii_alphanumeric()).unwrap_or(false);
    first_ok && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub fn collection_name(tenant_id: &str, store_id: &str) -> String {
    format!("{}_{}", tenant_id, store_id)
}

#[derive(Debug, Clone)]
pub struct IngestParams {
    pub tenant_id: String,
    pub store_id: String,
    pub thread_id: Option<String>,
    pub file_id: Option<String>,
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub conversion_service_url: Option<String>,
    pub chunk_params: ChunkParams,
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub collection: String,
    pub file_id: String,
    pub chunks_ingested: usize,
}

#[derive(Debug, Clone)]
pub struct RetrieveParams {
    pub tenant_id: String,
    pub store_id: String,
    pub thread_id: Option<String>,
    pub query: String,
    pub top_k: usize,
}

impl Default for RetrieveParams {
    fn default() -> Self {
        RetrieveParams {
            tenant_id: String::new(),
            store_id: String::new(),
            thread_id: None,
            query: String::new(),
            top_k: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub text: String,
    pub filename: String,
    pub chunk_index: usize,
    pub score: f32,
}

fn validate_names(tenant_id: &str, store_id: &str) -> Result<(), GatewayError> {
    if !is_valid_identifier(tenant_id) || !is_valid_identifier(store_id) {
        return Err(GatewayError::InvalidArgument(
            "tenant-id and store-id must match [A-Za-z0-9][A-Za-z0-9_-]*, <=128 chars".to_string(),
        ));
    }
    Ok(())
}

pub async fn ingest(
    params: IngestParams,
    embedder: &dyn Embedder,
    store: &dyn VectorStore,
) -> Result<IngestOutcome, GatewayError> {
    validate_names(&params.tenant_id, &params.store_id)?;
    let collection = collection_name(&params.tenant_id, &params.store_id);

    if !store
        .collection_exists(&collection)
        .await
        .map_err(GatewayError::Internal)?
    {
        store
            .create_collection(&collection, embedder.dimensions())
            .await
            .map_err(GatewayError::Internal)?;
    }

    let extracted = extract(
        &params.bytes,
        &params.filename,
        &params.mime_type,
        params.conversion_service_url.as_deref(),
    )
    .await;

    let chunks = chunk_text(&extracted.text, params.chunk_params);
    if chunks.is_empty() {
        let file_id = params
            .file_id
            .clone()
            .unwrap_or_else(|| legacy_file_id(&params.filename, &params.store_id));
        return Ok(IngestOutcome { collection, file_id, chunks_ingested: 0 });
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embedder.embed_batch(&texts).await.map_err(GatewayError::Internal)?;

    // The preferred contract is an opaque caller-supplied file-id; its absence falls back to a
    // filename-derived id that collides across repeat uploads of the same filename (§9).
    let file_id = params
        .file_id
        .clone()
        .unwrap_or_else(|| legacy_file_id(&params.filename, &params.store_id));

    let points: Vec<Point> = chunks
        .iter()
        .zip(vectors.into_iter())
        .map(|(chunk, vector)| {
            let mut payload = std::collections::HashMap::new();
            payload.insert("tenant_id".to_string(), json!(params.tenant_id));
            if let Some(thread_id) = &params.thread_id {
                payload.insert("thread_id".to_string(), json!(thread_id));
            }
            payload.insert("store_id".to_string(), json!(params.store_id));
            payload.insert("file_id".to_string(), json!(file_id));
            payload.insert("filename".to_string(), json!(params.filename));
            payload.insert("chunk_index".to_string(), json!(chunk.index));
            payload.insert("text".to_string(), json!(chunk.text));
            payload.insert("char_start".to_string(), json!(chunk.char_start));
            payload.insert("char_end".to_string(), json!(chunk.char_end));
            Point { id: format!("{}_{}", file_id, chunk.index), vector, payload }
        })
        .collect();

    let chunks_ingested = points.len();
    store
        .upsert(&collection, points)
        .await
        .map_err(GatewayError::Internal)?;

    Ok(IngestOutcome { collection, file_id, chunks_ingested })
}

fn legacy_file_id(filename: &str, store_id: &str) -> String {
    format!("{}_{}", filename, store_id)
}

pub async fn retrieve(
    params: RetrieveParams,
    embedder: &dyn Embedder,
    store: &dyn VectorStore,
) -> Result<Vec<RetrievedChunk>, GatewayError> {
    validate_names(&params.tenant_id, &params.store_id)?;
    let collection = collection_name(&params.tenant_id, &params.store_id);

    if !store
        .collection_exists(&collection)
        .await
        .map_err(GatewayError::Internal)?
    {
        return Ok(Vec::new());
    }

    let query_vector = embedder.embed(&params.query).await.map_err(GatewayError::Internal)?;
    let mut filter = Filter::default();
    if let Some(thread_id) = &params.thread_id {
        filter.equals.push(("thread_id".to_string(), json!(thread_id)));
    }

    let top_k = if params.top_k == 0 { 5 } else { params.top_k };
    let results = store
        .search(&collection, &query_vector, top_k, &filter, None)
        .await
        .map_err(GatewayError::Internal)?;

    Ok(results
        .into_iter()
        .map(|r| RetrievedChunk {
            text: r.payload.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            filename: r
                .payload
                .get("filename")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            chunk_index: r.payload.get("chunk_index").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
            score: r.score,
        })
        .collect())
}
