//! Request options and the structured results returned by the engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use jobrag_core::types::{ChunkId, FusedResult, JobId, JobStatus, RetrievalMethod};
use jobrag_core::JobScope;
use jobrag_text::QueryIntent;

use crate::aggregate::AssembledContext;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
	/// Chunks kept in the final context.
	pub top_k: usize,
	/// Hits requested from each backend before fusion.
	pub candidate_limit: usize,
	pub rerank: bool,
	pub expand: bool,
	pub include_related: bool,
	/// Restrict retrieval to one document.
	pub document: Option<String>,
}

impl Default for QueryOptions {
	fn default() -> Self {
		Self { top_k: 5, candidate_limit: 20, rerank: true, expand: true, include_related: true, document: None }
	}
}

impl QueryOptions {
	pub fn with_top_k(mut self, top_k: usize) -> Self { self.top_k = top_k; self }
	pub fn with_document(mut self, document: impl Into<String>) -> Self { self.document = Some(document.into()); self }
	pub fn without_rerank(mut self) -> Self { self.rerank = false; self }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackendStatus {
	Ok,
	TimedOut { timeout_ms: u64 },
	Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendReport {
	pub method: RetrievalMethod,
	pub hits: usize,
	#[serde(flatten)]
	pub status: BackendStatus,
	pub elapsed_ms: u64,
}

impl BackendReport {
	pub fn is_ok(&self) -> bool { self.status == BackendStatus::Ok }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MethodBreakdown {
	pub backends: Vec<BackendReport>,
	/// Fused candidates found by more than one method.
	pub overlap: usize,
	pub fused: usize,
	pub reranked: bool,
	pub deduplicated: usize,
	pub phrasings: Vec<String>,
	pub intents: Vec<QueryIntent>,
}

impl MethodBreakdown {
	pub fn hits(&self, method: RetrievalMethod) -> usize {
		self.backends.iter().filter(|b| b.method == method).map(|b| b.hits).sum()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
	NoResults,
	Low,
	Medium,
	High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
	RerankerUnavailable { reason: String },
	BackendUnavailable { method: RetrievalMethod, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfidenceSignal {
	pub level: ConfidenceLevel,
	pub degradations: Vec<Degradation>,
}

impl ConfidenceSignal {
	/// `agreement` is the share of final chunks found by more than one method.
	pub fn assess(documents: usize, chunks: usize, agreement: f64, degradations: Vec<Degradation>) -> Self {
		let mut level = if chunks == 0 {
			ConfidenceLevel::NoResults
		} else if documents >= 3 && agreement >= 0.5 {
			ConfidenceLevel::High
		} else if (documents >= 1 && agreement >= 0.3) || documents >= 2 {
			ConfidenceLevel::Medium
		} else {
			ConfidenceLevel::Low
		};
		if !degradations.is_empty() { level = level.min(ConfidenceLevel::Medium); }
		Self { level, degradations }
	}

	pub fn is_degraded(&self) -> bool { !self.degradations.is_empty() }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
	pub query: String,
	pub scope: JobScope,
	pub ranked_context: AssembledContext,
	/// Fused results behind the context passages, in final order.
	pub results: Vec<FusedResult>,
	pub method_breakdown: MethodBreakdown,
	pub confidence: ConfidenceSignal,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
	pub text: String,
	pub response: QueryResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexAck {
	pub chunk_id: ChunkId,
	/// `false` when the chunk was already indexed.
	pub indexed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchAck {
	pub indexed: usize,
	pub skipped: usize,
	pub chunk_ids: Vec<ChunkId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
	pub scope: JobScope,
	pub jobs: usize,
	pub chunks: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobIndexStatus {
	pub status: Option<JobStatus>,
	pub documents: usize,
	pub chunks: usize,
	pub keyword_entries: usize,
	pub vectors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStatus {
	pub jobs: BTreeMap<JobId, JobIndexStatus>,
	pub totals: JobIndexStatus,
	/// Snapshot version of each backend.
	pub versions: BTreeMap<RetrievalMethod, u64>,
}
