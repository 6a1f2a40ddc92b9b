//! Reranker adapter and the bundled relevance judges.
//!
//! The adapter sends the top fused candidates to a [`Reranker`] under a
//! timeout. Whatever the judge returns is sanitized into a permutation of the
//! candidates; on failure or timeout the fused order is kept and the outcome
//! is flagged as degraded.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use jobrag_core::config::{RerankProvider, RerankSettings};
use jobrag_core::traits::{RerankCandidate, RerankJudgement, Reranker};
use jobrag_core::types::{Chunk, FusedResult, Priority};

/// A fused result together with the chunk it points at.
#[derive(Debug, Clone)]
pub struct Candidate {
	pub fused: FusedResult,
	pub chunk: Arc<Chunk>,
}

#[derive(Debug, Clone)]
pub struct RerankOutcome {
	pub candidates: Vec<Candidate>,
	pub reranked: bool,
	/// Set when the judge failed or timed out; carries the reason.
	pub degraded: Option<String>,
}

pub struct RerankAdapter {
	reranker: Option<Arc<dyn Reranker>>,
	top_n: usize,
	timeout: Duration,
}

impl RerankAdapter {
	pub fn new(reranker: Arc<dyn Reranker>, top_n: usize, timeout_ms: u64) -> Self {
		Self { reranker: Some(reranker), top_n: top_n.max(1), timeout: Duration::from_millis(timeout_ms) }
	}

	pub fn disabled() -> Self { Self { reranker: None, top_n: 0, timeout: Duration::ZERO } }

	pub fn from_settings(settings: &RerankSettings) -> AnyResult<Self> {
		if !settings.enabled { return Ok(Self::disabled()); }
		let judge: Arc<dyn Reranker> = match settings.provider {
			RerankProvider::None => return Ok(Self::disabled()),
			RerankProvider::Heuristic => Arc::new(HeuristicReranker),
			RerankProvider::Http => {
				let endpoint = settings.endpoint.clone().ok_or_else(|| anyhow!("rerank.endpoint is required for the http reranker"))?;
				let api_key = settings.api_key_env.as_deref().and_then(|name| std::env::var(name).ok());
				Arc::new(HttpReranker::new(endpoint, settings.model.clone(), settings.timeout_ms, api_key)?)
			}
		};
		Ok(Self::new(judge, settings.top_n, settings.timeout_ms))
	}

	pub fn is_enabled(&self) -> bool { self.reranker.is_some() }

	pub fn judge_name(&self) -> Option<&str> { self.reranker.as_ref().map(|r| r.name()) }

	pub async fn rerank(&self, query: &str, mut candidates: Vec<Candidate>) -> RerankOutcome {
		let Some(judge) = &self.reranker else {
			return RerankOutcome { candidates, reranked: false, degraded: None };
		};
		let n = candidates.len().min(self.top_n);
		if n < 2 {
			return RerankOutcome { candidates, reranked: false, degraded: None };
		}
		let request: Vec<RerankCandidate> = candidates[..n]
			.iter()
			.map(|c| RerankCandidate {
				chunk_id: c.fused.chunk_id.clone(),
				text: c.chunk.text().to_string(),
				section_type: c.chunk.section_type().to_string(),
				priority: c.chunk.priority(),
				fused_score: c.fused.score,
			})
			.collect();

		let failure = match tokio::time::timeout(self.timeout, judge.judge(query, &request)).await {
			Err(_) => format!("reranker '{}' timed out after {} ms", judge.name(), self.timeout.as_millis()),
			Ok(Err(err)) => format!("reranker '{}' failed: {err}", judge.name()),
			Ok(Ok(judgement)) => match sanitize(judgement, n) {
				Some(order) => {
					let head: Vec<Candidate> = candidates.drain(..n).collect();
					let mut slots: Vec<Option<Candidate>> = head.into_iter().map(Some).collect();
					let mut reordered: Vec<Candidate> = order.into_iter().filter_map(|i| slots[i].take()).collect();
					reordered.append(&mut candidates);
					debug!(judge = judge.name(), candidates = n, "Reranked fused candidates");
					return RerankOutcome { candidates: reordered, reranked: true, degraded: None };
				}
				None => format!("reranker '{}' returned an unusable judgement", judge.name()),
			},
		};
		warn!(error = %failure, "Falling back to fused order");
		RerankOutcome { candidates, reranked: false, degraded: Some(failure) }
	}
}

/// Turn a judgement over `n` candidates into a full permutation of `0..n`.
///
/// Orderings drop out-of-range and repeated indices and append omitted
/// candidates in fused order; an ordering with no usable index is rejected.
/// Scores must be finite and one per candidate; ties keep fused order.
pub fn sanitize(judgement: RerankJudgement, n: usize) -> Option<Vec<usize>> {
	match judgement {
		RerankJudgement::Ordering(indices) => {
			let mut seen = vec![false; n];
			let mut order: Vec<usize> = Vec::with_capacity(n);
			for i in indices {
				if i < n && !seen[i] { seen[i] = true; order.push(i); }
			}
			if order.is_empty() { return None; }
			order.extend((0..n).filter(|&i| !seen[i]));
			Some(order)
		}
		RerankJudgement::Scores(scores) => {
			if scores.len() != n || scores.iter().any(|s| !s.is_finite()) { return None; }
			let mut order: Vec<usize> = (0..n).collect();
			order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
			Some(order)
		}
	}
}

/// Local judge: boosts the fused score by chunk priority and section.
pub struct HeuristicReranker;

impl HeuristicReranker {
	pub fn boost(candidate: &RerankCandidate) -> f64 {
		let mut boost = 1.0;
		if candidate.priority == Priority::High { boost *= 1.3; }
		let section = candidate.section_type.to_lowercase();
		if ["abstract", "contribution", "conclusion"].iter().any(|s| section.contains(s)) {
			boost *= 1.2;
		} else if ["method", "approach", "implementation"].iter().any(|s| section.contains(s)) {
			boost *= 1.15;
		}
		boost
	}
}

#[async_trait]
impl Reranker for HeuristicReranker {
	fn name(&self) -> &str { "heuristic" }

	async fn judge(&self, _query: &str, candidates: &[RerankCandidate]) -> AnyResult<RerankJudgement> {
		Ok(RerankJudgement::Scores(candidates.iter().map(|c| c.fused_score * Self::boost(c)).collect()))
	}
}

/// Cross-encoder style judge over HTTP: POST `{model, query, documents}`,
/// reads `results[].index` and `results[].relevance_score`.
pub struct HttpReranker {
	client: Client,
	endpoint: String,
	model: Option<String>,
	api_key: Option<String>,
}

impl HttpReranker {
	pub fn new(endpoint: String, model: Option<String>, timeout_ms: u64, api_key: Option<String>) -> AnyResult<Self> {
		let client = Client::builder().timeout(Duration::from_millis(timeout_ms)).build()?;
		Ok(Self { client, endpoint, model, api_key })
	}
}

#[async_trait]
impl Reranker for HttpReranker {
	fn name(&self) -> &str { "http" }

	async fn judge(&self, query: &str, candidates: &[RerankCandidate]) -> AnyResult<RerankJudgement> {
		let docs: Vec<&str> = candidates.iter().map(|c| c.text.as_str()).collect();
		let mut body = serde_json::json!({ "query": query, "documents": docs });
		if let Some(model) = &self.model { body["model"] = Value::String(model.clone()); }
		let mut req = self.client.post(&self.endpoint).json(&body);
		if let Some(key) = &self.api_key { req = req.bearer_auth(key); }
		let json: Value = req.send().await?.error_for_status()?.json().await?;
		Ok(RerankJudgement::Scores(parse_rerank_response(&json, candidates.len())?))
	}
}

/// Scores aligned by `index`; candidates the service left out score zero.
pub fn parse_rerank_response(json: &Value, doc_count: usize) -> AnyResult<Vec<f64>> {
	let mut scores = vec![0.0f64; doc_count];
	let results = json
		.get("results")
		.or_else(|| json.get("data"))
		.and_then(|v| v.as_array())
		.ok_or_else(|| anyhow!("Rerank response is missing results array."))?;
	for item in results {
		let index = item.get("index").and_then(Value::as_u64).ok_or_else(|| anyhow!("Rerank result missing index."))? as usize;
		let score = item
			.get("relevance_score")
			.or_else(|| item.get("score"))
			.and_then(Value::as_f64)
			.ok_or_else(|| anyhow!("Rerank result missing score."))?;
		if index < scores.len() { scores[index] = score; }
	}
	Ok(scores)
}
