//! Context assembly: dedup overlapping windows, group by document, enforce
//! the word budget and keep provenance for citation.
//!
//! Two dedup passes run per candidate. A passage whose token set is mostly
//! contained in a kept passage (overlap coefficient at or above the
//! threshold) is dropped. Otherwise, a word run shared with the boundary of a
//! kept window of the same document is cut, so adjacent windows never repeat
//! their overlap in the context.

use std::collections::HashSet;
use std::fmt::Write as _;

use serde::Serialize;

use jobrag_core::config::AggregateSettings;
use jobrag_core::types::{ChunkId, DocumentId, FusedResult, JobId, RelatedDocument};
use jobrag_core::JobScoped;

use crate::rerank::Candidate;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContextPassage {
	pub chunk_id: ChunkId,
	pub document_id: DocumentId,
	pub section_type: String,
	pub text: String,
	pub score: f64,
	/// 1-based position in the final ranking.
	pub rank: usize,
	pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DocumentContext {
	pub document_id: DocumentId,
	pub job_id: JobId,
	pub passages: Vec<ContextPassage>,
	pub related: Vec<RelatedDocument>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AssembledContext {
	pub documents: Vec<DocumentContext>,
	pub word_count: usize,
	pub truncated: bool,
	pub deduplicated: usize,
	/// Words cut because they repeat the boundary of a kept window.
	pub overlap_words: usize,
	#[serde(skip)]
	selected: Vec<FusedResult>,
}

impl AssembledContext {
	pub fn is_empty(&self) -> bool { self.documents.is_empty() }

	pub fn passage_count(&self) -> usize { self.documents.iter().map(|d| d.passages.len()).sum() }

	/// Fused results of the kept passages, in final rank order.
	pub fn selected(&self) -> &[FusedResult] { &self.selected }

	pub fn passages(&self) -> impl Iterator<Item = &ContextPassage> { self.documents.iter().flat_map(|d| d.passages.iter()) }

	pub fn render(&self) -> String {
		let mut out = String::new();
		for doc in &self.documents {
			for p in &doc.passages {
				let _ = writeln!(out, "[{} | {}]", doc.document_id, p.section_type);
				let _ = writeln!(out, "{}\n", p.text);
			}
			if !doc.related.is_empty() {
				let related: Vec<&str> = doc.related.iter().map(|r| r.document_id.as_str()).collect();
				let _ = writeln!(out, "Related to {}: {}\n", doc.document_id, related.join(", "));
			}
		}
		out.trim_end().to_string()
	}
}

/// Shortest shared run treated as window overlap rather than coincidence.
const MIN_SHARED_RUN: usize = 8;

/// |A ∩ B| / min(|A|, |B|).
pub fn overlap_coefficient(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
	let smaller = a.len().min(b.len());
	if smaller == 0 { return if a.len() == b.len() { 1.0 } else { 0.0 }; }
	a.intersection(b).count() as f64 / smaller as f64
}

/// Length of the longest run that ends `earlier` and starts `later`.
fn shared_run(earlier: &[&str], later: &[&str]) -> usize {
	let max = earlier.len().min(later.len());
	(MIN_SHARED_RUN..=max).rev().find(|&k| earlier[earlier.len() - k..] == later[..k]).unwrap_or(0)
}

fn token_set(candidate: &Candidate) -> HashSet<String> {
	let tokens = candidate.chunk.tokens();
	if tokens.is_empty() {
		candidate.chunk.text().split_whitespace().map(str::to_lowercase).collect()
	} else {
		tokens.iter().cloned().collect()
	}
}

pub struct Aggregator {
	settings: AggregateSettings,
}

impl Aggregator {
	pub fn new(settings: AggregateSettings) -> Self { Self { settings } }

	pub fn settings(&self) -> &AggregateSettings { &self.settings }

	/// Assemble at most `top_k` passages from candidates in final order.
	pub fn assemble(&self, ranked: &[Candidate], top_k: usize) -> AssembledContext {
		let mut ctx = AssembledContext::default();
		let mut kept_sets: Vec<HashSet<String>> = Vec::new();
		let mut kept_windows: Vec<(usize, Vec<&str>)> = Vec::new();
		let mut budget = self.settings.max_context_words;

		for candidate in ranked {
			if ctx.selected.len() >= top_k || budget == 0 { break; }
			let set = token_set(candidate);
			if kept_sets.iter().any(|k| overlap_coefficient(k, &set) >= self.settings.dedup_threshold) {
				ctx.deduplicated += 1;
				continue;
			}
			let chunk = &candidate.chunk;
			let slot = match ctx.documents.iter().position(|d| d.document_id == chunk.document_id() && &d.job_id == chunk.job_id()) {
				Some(i) if ctx.documents[i].passages.len() >= self.settings.max_chunks_per_document => continue,
				Some(i) => i,
				None if ctx.documents.len() >= self.settings.max_documents => continue,
				None => {
					ctx.documents.push(DocumentContext {
						document_id: chunk.document_id().to_string(),
						job_id: chunk.job_id().clone(),
						passages: Vec::new(),
						related: Vec::new(),
					});
					ctx.documents.len() - 1
				}
			};

			let window: Vec<&str> = chunk.text().split_whitespace().collect();
			let mut words = window.clone();
			let mut cut = 0;
			for (_, prior) in kept_windows.iter().filter(|(s, _)| *s == slot) {
				let head = shared_run(prior, &words);
				words.drain(..head);
				let tail = shared_run(&words, prior);
				words.truncate(words.len() - tail);
				cut += head + tail;
			}
			if words.is_empty() {
				ctx.deduplicated += 1;
				continue;
			}
			ctx.overlap_words += cut;
			let truncated = words.len() > budget;
			let taken = words.len().min(budget);
			budget -= taken;
			ctx.word_count += taken;
			ctx.truncated |= truncated;
			ctx.selected.push(candidate.fused.clone());
			kept_sets.push(set);
			kept_windows.push((slot, window));
			ctx.documents[slot].passages.push(ContextPassage {
				chunk_id: chunk.id().to_string(),
				document_id: chunk.document_id().to_string(),
				section_type: chunk.section_type().to_string(),
				text: match (truncated, cut) {
					(true, _) => format!("{}...", words[..taken].join(" ")),
					(false, 0) => chunk.text().to_string(),
					(false, _) => words.join(" "),
				},
				score: candidate.fused.score,
				rank: ctx.selected.len(),
				truncated,
			});
		}
		ctx
	}
}
