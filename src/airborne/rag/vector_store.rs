//! Qdrant-compatible vector store client (§6 wire shapes): `PUT /collections/<n>`,
//! `POST /collections/<n>/points?wait=true`, `POST /collections/<n>/points/search`,
//! `POST /collections/<n>/points/delete`. Cosine distance is the default. Filter is an AND of
//! equality conditions on payload fields.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub point_count: u64,
    pub dimensions: usize,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, Value>,
}

/// An AND of equality conditions on payload fields.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub equals: Vec<(String, Value)>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    fn to_json(&self) -> Option<Value> {
        if self.equals.is_empty() {
            return None;
        }
        let must: Vec<Value> = self
            .equals
            .iter()
            .map(|(key, value)| json!({"key": key, "match": {"value": value}}))
            .collect();
        Some(json!({"must": must}))
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn create_collection(&self, name: &str, dims: usize) -> Result<(), String>;
    async fn delete_collection(&self, name: &str) -> Result<(), String>;
    async fn collection_exists(&self, name: &str) -> Result<bool, String>;
    async fn collection_info(&self, name: &str) -> Result<CollectionInfo, String>;
    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<(), String>;
    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        filter: &Filter,
        score_threshold: Option<f32>,
    ) -> Result<Vec<SearchResult>, String>;
    async fn delete(&self, name: &str, ids: &[String]) -> Result<(), String>;
}

pub struct QdrantStore {
    base_url: String,
}

impl QdrantStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        QdrantStore { base_url: base_url.into().trim_end_matches('/').to_string() }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Value, String> {
        let resp = builder.send().await.map_err(|e| e.to_string())?;
        let status = resp.status();
        let value: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(format!("{} {}", status.as_u16(), value));
        }
        Ok(value)
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn create_collection(&self, name: &str, dims: usize) -> Result<(), String> {
        let client = crate::airborne::provider::common::shared_http_client();
        let body = json!({"vectors": {"size": dims, "distance": "Cosine"}});
        self.send(client.put(self.url(&format!("/collections/{}", name))).json(&body))
            .await?;
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), String> {
        let client = crate::airborne::provider::common::shared_http_client();
        let resp = client
            .delete(self.url(&format!("/collections/{}", name)))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(format!("delete_collection failed with status {}", resp.status()));
        }
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, String> {
        let client = crate::airborne::provider::common::shared_http_client();
        let resp = client
            .get(self.url(&format!("/collections/{}", name)))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(resp.status().is_success())
    }

    async fn collection_info(&self, name: &str) -> Result<CollectionInfo, String> {
        let client = crate::airborne::provider::common::shared_http_client();
        let value = self
            .send(client.get(self.url(&format!("/collections/{}", name))))
            .await?;
        Ok(CollectionInfo {
            point_count: value["result"]["points_count"].as_u64().unwrap_or(0),
            dimensions: value["result"]["config"]["params"]["vectors"]["size"]
                .as_u64()
                .unwrap_or(0) as usize,
        })
    }

    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<(), String> {
        let client = crate::airborne::provider::common::shared_http_client();
        let payload_points: Vec<Value> = points
            .into_iter()
            .map(|p| json!({"id": p.id, "vector": p.vector, "payload": p.payload}))
            .collect();
        let body = json!({"points": payload_points});
        self.send(
            client
                .post(self.url(&format!("/collections/{}/points?wait=true", name)))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        filter: &Filter,
        score_threshold: Option<f32>,
    ) -> Result<Vec<SearchResult>, String> {
        let client = crate::airborne::provider::common::shared_http_client();
        let mut body = json!({"vector": vector, "limit": limit, "with_payload": true});
        if let Some(f) = filter.to_json() {
            body["filter"] = f;
        }
        if let Some(threshold) = score_threshold {
            body["score_threshold"] = json!(threshold);
        }
        let value = self
            .send(
                client
                    .post(self.url(&format!("/collections/{}/points/search", name)))
                    .json(&body),
            )
            .await?;
        let results = value["result"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|item| SearchResult {
                id: item["id"].as_str().unwrap_or_default().to_string(),
                score: item["score"].as_f64().unwrap_or(0.0) as f32,
                payload: item["payload"]
                    .as_object()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .collect(),
            })
            .collect();
        Ok(results)
    }

    async fn delete(&self, name: &str, ids: &[String]) -> Result<(), String> {
        let client = crate::airborne::provider::common::shared_http_client();
        let body = json!({"points": ids});
        self.send(
            client
                .post(self.url(&format!("/collections/{}/points/delete", name)))
                .json(&body),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_with_no_conditions_serializes_to_none() {
        let f = Filter::default();
        assert!(f.is_empty());
        assert!(f.to_json().is_none());
    }

    #[test]
    fn filter_builds_must_equality_conditions() {
        let f = Filter { equals: vec![("thread-id".to_string(), json!("t1"))] };
        let rendered = f.to_json().unwrap();
        assert_eq!(rendered["must"][0]["key"], "thread-id");
        assert_eq!(rendered["must"][0]["match"]["value"], "t1");
    }

    #[test]
    fn new_trims_trailing_slash() {
        let store = QdrantStore::new("http://localhost:6333/");
        assert_eq!(store.base_url, "http://localhost:6333");
    }
}
