//! Reciprocal Rank Fusion: score = Σ 1/(k + rank_i)
//!
//! Combines ranked lists from different retrieval methods without normalizing
//! their scores. Only ranks matter, so BM25 and cosine values never mix.

use std::collections::{HashMap, HashSet};

use jobrag_core::types::{FusedResult, RankContribution, RankedResult};

/// Smoothing constant shared by every query in the process.
pub const RRF_K: u32 = 60;

pub fn rrf_term(rank: usize) -> f64 { 1.0 / (f64::from(RRF_K) + rank as f64) }

/// Fuse ranked lists (rank 1 = first element) into one ordering.
///
/// An id seen twice in the same list counts only at its first position.
/// Ties are broken by the best single-list rank, then by id.
pub fn reciprocal_rank_fusion(lists: &[Vec<RankedResult>]) -> Vec<FusedResult> {
	let mut fused: HashMap<&str, FusedResult> = HashMap::new();
	for list in lists {
		let mut seen = HashSet::new();
		for (pos, hit) in list.iter().enumerate() {
			if !seen.insert(hit.chunk_id.as_str()) { continue; }
			let rank = pos + 1;
			let entry = fused.entry(hit.chunk_id.as_str()).or_insert_with(|| FusedResult {
				chunk_id: hit.chunk_id.clone(),
				score: 0.0,
				contributions: Vec::new(),
			});
			entry.score += rrf_term(rank);
			entry.contributions.push(RankContribution { method: hit.method, rank });
		}
	}
	let mut out: Vec<FusedResult> = fused.into_values().collect();
	out.sort_by(|a, b| {
		b.score
			.total_cmp(&a.score)
			.then_with(|| a.best_rank().cmp(&b.best_rank()))
			.then_with(|| a.chunk_id.cmp(&b.chunk_id))
	});
	out
}
