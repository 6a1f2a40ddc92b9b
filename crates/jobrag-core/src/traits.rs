//! Seams between the engine and its collaborators.
//!
//! Collaborators outside the engine (embedding, reranking, answer generation,
//! relationship lookup) return `anyhow::Result`: their failures are opaque and
//! the engine maps them into its own error taxonomy. The retrieval backends and
//! the chunk store are part of the engine and use [`crate::error::Result`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::isolation::{JobScope, JobScoped};
use crate::types::{Chunk, ChunkId, Document, DocumentId, JobId, Priority, Query, RankedResult, RelatedDocument, RetrievalMethod};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Stable identifier of the model and its version; part of cache keys.
    fn id(&self) -> &str;
    fn dim(&self) -> usize;
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop().ok_or_else(|| anyhow::anyhow!("embedder '{}' returned no vector", self.id()))
    }
}

/// What the relevance judge gets to see about each candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankCandidate {
    pub chunk_id: ChunkId,
    pub text: String,
    pub section_type: String,
    pub priority: Priority,
    pub fused_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RerankJudgement {
    /// Candidate indices, best first.
    Ordering(Vec<usize>),
    /// One relevance score per candidate, higher is better.
    Scores(Vec<f64>),
}

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;
    async fn judge(&self, query: &str, candidates: &[RerankCandidate]) -> anyhow::Result<RerankJudgement>;
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, query: &str, context: &str) -> anyhow::Result<String>;
}

pub trait RelationshipLookup: Send + Sync {
    fn related(&self, document_id: &str, job_id: &JobId) -> anyhow::Result<Vec<RelatedDocument>>;
}

/// Source of truth for chunks; both indexes can be rebuilt from it.
pub trait ChunkStore: Send + Sync {
    /// Returns `false` when a chunk with the same id is already stored.
    fn insert(&self, chunk: Arc<Chunk>) -> Result<bool>;
    fn get(&self, id: &str) -> Option<Arc<Chunk>>;
    /// Chunks admitted by `scope`, in insertion order.
    fn chunks(&self, scope: &JobScope) -> Vec<Arc<Chunk>>;
    fn jobs(&self) -> Vec<JobId>;
    /// Remove the given chunks; unknown ids are ignored. Returns how many were removed.
    fn remove(&self, ids: &[ChunkId]) -> Result<usize>;
    fn remove_job(&self, job: &JobId) -> Result<usize>;

    /// Chunks admitted by `scope` grouped by parent document, in first-seen order.
    fn documents(&self, scope: &JobScope) -> Vec<Document> {
        let mut documents: Vec<Document> = Vec::new();
        let mut slots: HashMap<(JobId, DocumentId), usize> = HashMap::new();
        for chunk in self.chunks(scope) {
            let key = (chunk.job_id().clone(), chunk.document_id().to_string());
            let slot = *slots.entry(key).or_insert_with(|| {
                documents.push(Document { id: chunk.document_id().to_string(), job_id: chunk.job_id().clone(), chunk_ids: Vec::new() });
                documents.len() - 1
            });
            documents[slot].chunk_ids.push(chunk.id().to_string());
        }
        documents
    }

    fn len(&self) -> usize;
    fn is_empty(&self) -> bool { self.len() == 0 }
    /// Persist if the store is backed by a file; a no-op otherwise.
    fn flush(&self) -> Result<()> { Ok(()) }
}

/// Entry counts of one backend, per job, with the snapshot version they came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCounts {
    pub version: u64,
    pub per_job: BTreeMap<JobId, usize>,
}

impl BackendCounts {
    pub fn total(&self) -> usize { self.per_job.values().sum() }
}

/// Uniform capability interface for a retrieval method.
///
/// Writes publish atomically: a concurrent `search` sees all of a batch or none of it.
pub trait RetrievalBackend: Send + Sync {
    fn method(&self) -> RetrievalMethod;
    /// Index a batch; returns how many chunks were new. Known ids are skipped.
    fn index(&self, chunks: &[Arc<Chunk>]) -> Result<usize>;
    /// Replace every partition admitted by `scope` with exactly `chunks`.
    fn rebuild(&self, scope: &JobScope, chunks: &[Arc<Chunk>]) -> Result<()>;
    fn remove_job(&self, job: &JobId) -> Result<usize>;
    fn search(&self, query: &Query, limit: usize) -> Result<Vec<RankedResult>>;
    fn counts(&self) -> BackendCounts;
}
