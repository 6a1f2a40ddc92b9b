use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobrag_core::traits::{RerankCandidate, RerankJudgement, Reranker};
use jobrag_core::types::{Chunk, ChunkDraft, FusedResult, JobId, Priority, RankContribution, RetrievalMethod};
use jobrag_hybrid::{Candidate, HeuristicReranker, RerankAdapter};

fn candidate(i: usize, section: &str, priority: Priority, score: f64) -> Candidate {
	let draft = ChunkDraft::new(JobId::parse("a").unwrap(), format!("d{i}"), section, format!("passage number {i}"))
		.with_index(i)
		.with_priority(priority);
	let chunk = Arc::new(Chunk::from_draft(draft, vec![], None, i as u64).unwrap());
	let fused = FusedResult {
		chunk_id: chunk.id().to_string(),
		score,
		contributions: vec![RankContribution { method: RetrievalMethod::Keyword, rank: i + 1 }],
	};
	Candidate { fused, chunk }
}

fn candidates(n: usize) -> Vec<Candidate> {
	(0..n).map(|i| candidate(i, "body", Priority::Normal, 1.0 / (61 + i) as f64)).collect()
}

fn ids(cs: &[Candidate]) -> Vec<String> { cs.iter().map(|c| c.fused.chunk_id.clone()).collect() }

struct Slow;

#[async_trait]
impl Reranker for Slow {
	fn name(&self) -> &str { "slow" }
	async fn judge(&self, _q: &str, c: &[RerankCandidate]) -> anyhow::Result<RerankJudgement> {
		tokio::time::sleep(Duration::from_millis(500)).await;
		Ok(RerankJudgement::Ordering((0..c.len()).rev().collect()))
	}
}

struct Broken;

#[async_trait]
impl Reranker for Broken {
	fn name(&self) -> &str { "broken" }
	async fn judge(&self, _q: &str, _c: &[RerankCandidate]) -> anyhow::Result<RerankJudgement> {
		anyhow::bail!("service unavailable")
	}
}

struct Fixed(RerankJudgement);

#[async_trait]
impl Reranker for Fixed {
	fn name(&self) -> &str { "fixed" }
	async fn judge(&self, _q: &str, _c: &[RerankCandidate]) -> anyhow::Result<RerankJudgement> { Ok(self.0.clone()) }
}

#[tokio::test]
async fn timeout_keeps_fused_order_and_flags_degradation() {
	let input = candidates(4);
	let adapter = RerankAdapter::new(Arc::new(Slow), 15, 20);
	let out = adapter.rerank("q", input.clone()).await;
	assert_eq!(ids(&out.candidates), ids(&input));
	assert!(!out.reranked);
	assert!(out.degraded.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn failure_keeps_fused_order() {
	let input = candidates(3);
	let out = RerankAdapter::new(Arc::new(Broken), 15, 1000).rerank("q", input.clone()).await;
	assert_eq!(ids(&out.candidates), ids(&input));
	assert!(out.degraded.unwrap().contains("service unavailable"));
}

#[tokio::test]
async fn ordering_applies_to_head_and_tail_follows() {
	let input = candidates(5);
	let judge = Fixed(RerankJudgement::Ordering(vec![2, 2, 7, 0]));
	let out = RerankAdapter::new(Arc::new(judge), 3, 1000).rerank("q", input.clone()).await;
	let expected: Vec<String> = [2, 0, 1, 3, 4].iter().map(|&i| input[i].fused.chunk_id.clone()).collect();
	assert_eq!(ids(&out.candidates), expected);
	assert!(out.reranked);
	assert!(out.degraded.is_none());
}

#[tokio::test]
async fn unusable_judgement_degrades() {
	let input = candidates(3);
	let wrong_len = Fixed(RerankJudgement::Scores(vec![0.5]));
	let out = RerankAdapter::new(Arc::new(wrong_len), 15, 1000).rerank("q", input.clone()).await;
	assert_eq!(ids(&out.candidates), ids(&input));
	assert!(out.degraded.is_some());
}

#[tokio::test]
async fn single_candidate_is_not_sent() {
	let out = RerankAdapter::new(Arc::new(Broken), 15, 1000).rerank("q", candidates(1)).await;
	assert!(!out.reranked);
	assert!(out.degraded.is_none());
}

#[tokio::test]
async fn heuristic_prefers_priority_and_key_sections() {
	let input = vec![
		candidate(0, "body", Priority::Normal, 0.0330),
		candidate(1, "abstract", Priority::High, 0.0300),
		candidate(2, "methods", Priority::Normal, 0.0310),
	];
	let out = RerankAdapter::new(Arc::new(HeuristicReranker), 15, 1000).rerank("q", input.clone()).await;
	let expected = vec![input[1].fused.chunk_id.clone(), input[2].fused.chunk_id.clone(), input[0].fused.chunk_id.clone()];
	assert_eq!(ids(&out.candidates), expected);
}

#[tokio::test]
async fn disabled_adapter_passes_through() {
	let input = candidates(3);
	let adapter = RerankAdapter::disabled();
	assert!(!adapter.is_enabled());
	let out = adapter.rerank("q", input.clone()).await;
	assert_eq!(ids(&out.candidates), ids(&input));
	assert!(out.degraded.is_none());
}
