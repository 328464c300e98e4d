//! Embedder contract (§4.10): `Embed`, `EmbedBatch`, `Dimensions`, `Model`. Dimensions are fixed
//! per model and known ahead of time — no discovery round-trip needed before calling
//! `CreateCollection`.

use async_trait::async_trait;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String>;
    fn dimensions(&self) -> usize;
    fn model(&self) -> &str;
}

/// Reference embedder talking to an Ollama-style `/api/embeddings` endpoint, mirroring the
/// teacher's reqwest-based HTTP client construction (`clients/common.rs`).
pub struct HttpEmbedder {
    base_url: String,
    model: String,
    dimensions: usize,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimensions: usize) -> Self {
        HttpEmbedder {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dimensions,
        }
    }

    /// Known dimensionality for the common embedding models named in §4.10.
    pub fn known_dimensions(model: &str) -> Option<usize> {
        match model {
            "nomic-embed-text" => Some(768),
            "bge-m3" => Some(1024),
            "all-minilm" => Some(384),
            _ => None,
        }
    }

    async fn request_one(&self, text: &str) -> Result<Vec<f32>, String> {
        let client = crate::airborne::provider::common::shared_http_client();
        let url = format!("{}/api/embeddings", self.base_url);
        let resp = client
            .post(&url)
            .json(&serde_json::json!({"model": self.model, "prompt": text}))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        let value: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;
        if !status.is_success() {
            return Err(format!("{} {}", status.as_u16(), value));
        }
        let vector = value["embedding"]
            .as_array()
            .ok_or_else(|| "embedding response missing 'embedding' array".to_string())?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        Ok(vector)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, String> {
        self.request_one(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.request_one(text).await?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model(&self) -> &str {
        &self.model
    }
}
