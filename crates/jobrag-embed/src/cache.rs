//! Embedding cache keyed by `(content_hash, embedder_id)`.
//!
//! Consulted before calling a provider and written through on misses, so
//! re-ingesting or re-indexing unchanged text never re-embeds it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;

use jobrag_core::traits::Embedder;

pub fn content_hash(text: &str) -> String { blake3::hash(text.as_bytes()).to_hex().to_string() }

#[derive(Default)]
pub struct EmbeddingCache {
    entries: RwLock<HashMap<(String, String), Arc<Vec<f32>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn get_many(&self, embedder_id: &str, hashes: &[String]) -> HashMap<String, Arc<Vec<f32>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = HashMap::new();
        for h in hashes {
            if let Some(v) = entries.get(&(h.clone(), embedder_id.to_string())) { out.insert(h.clone(), Arc::clone(v)); }
        }
        out
    }

    pub fn put_many(&self, embedder_id: &str, items: impl IntoIterator<Item = (String, Vec<f32>)>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for (hash, vector) in items { entries.insert((hash, embedder_id.to_string()), Arc::new(vector)); }
    }

    pub fn len(&self) -> usize { self.entries.read().unwrap_or_else(PoisonError::into_inner).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) { (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed)) }
}

pub struct CachedEmbedder<E> {
    inner: E,
    cache: Arc<EmbeddingCache>,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E, cache: Arc<EmbeddingCache>) -> Self { Self { inner, cache } }

    pub fn cache(&self) -> &Arc<EmbeddingCache> { &self.cache }
}

#[async_trait]
impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn id(&self) -> &str { self.inner.id() }
    fn dim(&self) -> usize { self.inner.dim() }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let hashes: Vec<String> = texts.iter().map(|t| content_hash(t)).collect();
        let cached = self.cache.get_many(self.id(), &hashes);
        let mut missing: Vec<usize> = Vec::new();
        for (i, h) in hashes.iter().enumerate() {
            if !cached.contains_key(h) && !missing.iter().any(|&j| hashes[j] == *h) { missing.push(i); }
        }
        self.cache.hits.fetch_add((texts.len() - missing.len()) as u64, Ordering::Relaxed);
        self.cache.misses.fetch_add(missing.len() as u64, Ordering::Relaxed);

        let mut fresh: HashMap<String, Arc<Vec<f32>>> = HashMap::new();
        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.inner.embed_batch(&batch).await?;
            if vectors.len() != batch.len() {
                bail!("embedder '{}' returned {} vectors for {} texts", self.id(), vectors.len(), batch.len());
            }
            let pairs: Vec<(String, Vec<f32>)> = missing.iter().map(|&i| hashes[i].clone()).zip(vectors).collect();
            for (h, v) in &pairs { fresh.insert(h.clone(), Arc::new(v.clone())); }
            self.cache.put_many(self.id(), pairs);
            tracing::debug!(embedder = self.id(), fresh = missing.len(), cached = cached.len(), "Embedded batch");
        }

        hashes
            .iter()
            .map(|h| {
                cached.get(h).or_else(|| fresh.get(h)).map(|v| v.as_ref().clone()).ok_or_else(|| anyhow::anyhow!("missing embedding for {h}"))
            })
            .collect()
    }
}
