use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use twox_hash::XxHash64;

use jobrag_core::config::{EmbedProvider, EmbedSettings};
use jobrag_core::traits::Embedder;

pub mod cache;
pub mod http;

pub use cache::{CachedEmbedder, EmbeddingCache};
pub use http::HttpEmbedder;

/// Deterministic local embedder: feature-hashes lowercased word tokens into
/// `dim` buckets with a hash-derived sign, then L2-normalizes.
///
/// Texts sharing words get positive cosine similarity; texts with disjoint
/// vocabularies land near zero. No model files, no network.
pub struct HashedTermEmbedder { dim: usize, id: String }

impl HashedTermEmbedder {
    pub fn new(dim: usize) -> Self { Self { dim: dim.max(1), id: format!("hashed-term:xxh64:d{}", dim.max(1)) } }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| t.chars().count() >= 3) {
            let mut hasher = XxHash64::with_seed(0);
            token.to_lowercase().hash(&mut hasher);
            let h = hasher.finish();
            let idx = (h % self.dim as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 { for x in &mut v { *x /= norm; } }
        v
    }
}

#[async_trait]
impl Embedder for HashedTermEmbedder {
    fn id(&self) -> &str { &self.id }
    fn dim(&self) -> usize { self.dim }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Build the configured provider, wrapped in a content-hash cache.
pub fn get_default_embedder(settings: &EmbedSettings) -> Result<Arc<dyn Embedder>> {
    let use_fake = std::env::var("APP_USE_FAKE_EMBEDDINGS").ok().is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let cache = Arc::new(EmbeddingCache::default());
    if use_fake || settings.provider == EmbedProvider::Hashed {
        tracing::debug!(dim = settings.dim, "Using hashed-term embedder");
        return Ok(Arc::new(CachedEmbedder::new(HashedTermEmbedder::new(settings.dim), cache)));
    }
    let endpoint = settings.endpoint.clone().ok_or_else(|| anyhow!("embed.endpoint is required for the http embedder"))?;
    let api_key = settings.api_key_env.as_deref().and_then(|name| std::env::var(name).ok());
    let http = HttpEmbedder::new(endpoint, settings.model.clone(), settings.dim, settings.timeout_ms, api_key)?
        .with_batch_size(settings.batch_size);
    Ok(Arc::new(CachedEmbedder::new(http, cache)))
}
