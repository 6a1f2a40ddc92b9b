//! OpenAI-style `/embeddings` provider over HTTP.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use jobrag_core::traits::Embedder;

pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: Option<String>,
    dim: usize,
    batch_size: usize,
    api_key: Option<String>,
    id: String,
}

impl HttpEmbedder {
    pub fn new(endpoint: String, model: Option<String>, dim: usize, timeout_ms: u64, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_millis(timeout_ms)).build()?;
        let id = format!("http:{}:d{dim}", model.as_deref().unwrap_or("default"));
        Ok(Self { client, endpoint, model, dim, batch_size: 32, api_key, id })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self { self.batch_size = batch_size.max(1); self }

    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut body = serde_json::json!({ "input": texts, "dimensions": self.dim });
        if let Some(model) = &self.model { body["model"] = Value::String(model.clone()); }
        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key { req = req.bearer_auth(key); }
        let json: Value = req.send().await?.error_for_status()?.json().await?;
        let vectors = parse_embedding_response(json)?;
        if vectors.len() != texts.len() {
            bail!("embedding response has {} vectors for {} inputs", vectors.len(), texts.len());
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dim) {
            bail!("embedding dimension {} does not match configured {}", bad.len(), self.dim);
        }
        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn id(&self) -> &str { &self.id }
    fn dim(&self) -> usize { self.dim }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            out.extend(self.embed_chunk(chunk).await?);
        }
        Ok(out)
    }
}

/// Reads `data[].embedding`, ordered by `data[].index` when present.
pub fn parse_embedding_response(json: Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("Embedding response is missing data array."))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (fallback_index, item) in data.iter().enumerate() {
        let index = item.get("index").and_then(Value::as_u64).map_or(fallback_index, |v| v as usize);
        let embedding = item
            .get("embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("Embedding item missing embedding array."))?;
        let vec = embedding
            .iter()
            .map(|value| value.as_f64().map(|n| n as f32).ok_or_else(|| anyhow!("Embedding value must be numeric.")))
            .collect::<Result<Vec<f32>>>()?;
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vec)| vec).collect())
}
