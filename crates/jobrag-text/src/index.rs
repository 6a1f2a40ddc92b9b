//! BM25 keyword index with per-job partitions.
//!
//! Each job owns a [`Partition`] of immutable segments; the partition map
//! lives in a [`SnapshotCell`], so a write adds one segment to the partition
//! it touches and publishes the new map in one swap.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use jobrag_core::config::KeywordSettings;
use jobrag_core::snapshot::SnapshotCell;
use jobrag_core::traits::{BackendCounts, RetrievalBackend};
use jobrag_core::types::{Chunk, ChunkId, JobId, Query, RankedResult, RetrievalMethod};
use jobrag_core::{belongs_to_job, Error, JobScope, JobScoped, Result};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
	pub k1: f64,
	pub b: f64,
}

impl Default for Bm25Params {
	fn default() -> Self { Self { k1: 1.5, b: 0.75 } }
}

impl From<&KeywordSettings> for Bm25Params {
	fn from(s: &KeywordSettings) -> Self { Self { k1: s.k1, b: s.b } }
}

#[derive(Debug, Clone, Copy)]
struct Posting {
	doc: usize,
	tf: u32,
}

#[derive(Debug, Clone)]
struct DocEntry {
	chunk: Arc<Chunk>,
	len: u32,
}

/// Documents indexed together; never mutated once published.
#[derive(Debug, Default)]
struct Segment {
	postings: HashMap<String, Vec<Posting>>,
	docs: Vec<DocEntry>,
	ids: HashMap<ChunkId, usize>,
	total_len: u64,
}

impl Segment {
	fn from_chunks<'a>(chunks: impl IntoIterator<Item = &'a Arc<Chunk>>) -> Self {
		let mut segment = Self::default();
		for chunk in chunks { segment.insert(chunk); }
		segment
	}

	fn insert(&mut self, chunk: &Arc<Chunk>) -> bool {
		if self.ids.contains_key(chunk.id()) { return false; }
		let doc = self.docs.len();
		let mut freqs: HashMap<&str, u32> = HashMap::new();
		for token in chunk.tokens() { *freqs.entry(token.as_str()).or_default() += 1; }
		for (term, tf) in freqs {
			self.postings.entry(term.to_string()).or_default().push(Posting { doc, tf });
		}
		let len = u32::try_from(chunk.tokens().len()).unwrap_or(u32::MAX);
		self.total_len += u64::from(len);
		self.ids.insert(chunk.id().to_string(), doc);
		self.docs.push(DocEntry { chunk: Arc::clone(chunk), len });
		true
	}
}

/// One job's index as a list of shared segments, oldest first.
///
/// Cloning a partition copies only segment pointers, so a write allocates the
/// new batch's segment and nothing else. Trailing segments are merged while
/// the newer one is at least half the size of the older one, which keeps the
/// segment count logarithmic in the number of documents.
#[derive(Debug, Clone, Default)]
struct Partition {
	segments: Vec<Arc<Segment>>,
}

impl Partition {
	fn from_chunks<'a>(chunks: impl IntoIterator<Item = &'a Arc<Chunk>>) -> Self {
		let segment = Segment::from_chunks(chunks);
		Self { segments: if segment.docs.is_empty() { Vec::new() } else { vec![Arc::new(segment)] } }
	}

	fn contains(&self, id: &str) -> bool { self.segments.iter().any(|s| s.ids.contains_key(id)) }

	fn len(&self) -> usize { self.segments.iter().map(|s| s.docs.len()).sum() }

	fn total_len(&self) -> u64 { self.segments.iter().map(|s| s.total_len).sum() }

	fn df(&self, term: &str) -> usize { self.segments.iter().map(|s| s.postings.get(term).map_or(0, Vec::len)).sum() }

	/// Append the unseen chunks of `batch` as a new segment; returns how many were added.
	fn append(&mut self, batch: Vec<&Arc<Chunk>>) -> usize {
		let mut segment = Segment::default();
		for chunk in batch.into_iter().filter(|c| !self.contains(c.id())) { segment.insert(chunk); }
		let added = segment.docs.len();
		if added == 0 { return 0; }
		self.segments.push(Arc::new(segment));
		while let [.., older, newer] = self.segments.as_slice() {
			if newer.docs.len() * 2 < older.docs.len() { break; }
			let merged = Segment::from_chunks(older.docs.iter().chain(&newer.docs).map(|d| &d.chunk));
			self.segments.truncate(self.segments.len() - 2);
			self.segments.push(Arc::new(merged));
		}
		added
	}
}

type Partitions = BTreeMap<JobId, Arc<Partition>>;

/// Corpus statistics for the partitions a query may see.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct KeywordStats {
	pub documents: usize,
	pub terms: usize,
	pub total_tokens: u64,
	pub avgdl: f64,
	pub segments: usize,
}

pub struct KeywordIndex {
	params: Bm25Params,
	partitions: SnapshotCell<Partitions>,
}

impl Default for KeywordIndex {
	fn default() -> Self { Self::new(Bm25Params::default()) }
}

impl KeywordIndex {
	pub fn new(params: Bm25Params) -> Self {
		Self { params, partitions: SnapshotCell::default() }
	}

	pub fn stats(&self, scope: &JobScope) -> KeywordStats {
		let snapshot = self.partitions.load();
		let parts = eligible(&snapshot, scope);
		let documents: usize = parts.iter().map(|p| p.len()).sum();
		let total_tokens: u64 = parts.iter().map(|p| p.total_len()).sum();
		let mut terms: Vec<&str> =
			parts.iter().flat_map(|p| p.segments.iter()).flat_map(|s| s.postings.keys().map(String::as_str)).collect();
		terms.sort_unstable();
		terms.dedup();
		let avgdl = if documents == 0 { 0.0 } else { total_tokens as f64 / documents as f64 };
		let segments = parts.iter().map(|p| p.segments.len()).sum();
		KeywordStats { documents, terms: terms.len(), total_tokens, avgdl, segments }
	}

	/// BM25 score of one chunk, `None` if the chunk is not visible in `scope`.
	/// A chunk containing none of `terms` scores exactly zero.
	pub fn score(&self, scope: &JobScope, terms: &[String], chunk_id: &str) -> Option<f64> {
		let snapshot = self.partitions.load();
		let parts = eligible(&snapshot, scope);
		if !parts.iter().any(|p| p.contains(chunk_id)) { return None; }
		let scores = self.score_terms(&parts, terms, None);
		Some(scores.get(chunk_id).map_or(0.0, |(_, s)| *s))
	}

	/// Keyword search over the partitions admitted by `scope`.
	///
	/// Each phrasing in `phrasings` is scored on its own and a chunk keeps its
	/// best score. Results are ordered by score, then by insertion order.
	pub fn search_terms(&self, scope: &JobScope, phrasings: &[&[String]], document: Option<&str>, limit: usize) -> Vec<(Arc<Chunk>, f64)> {
		let snapshot = self.partitions.load();
		let parts = eligible(&snapshot, scope);
		let mut best: HashMap<&str, (&Arc<Chunk>, f64)> = HashMap::new();
		for terms in phrasings.iter().filter(|t| !t.is_empty()) {
			for (id, (chunk, score)) in self.score_terms(&parts, terms, document) {
				let slot = best.entry(id).or_insert((chunk, score));
				if score > slot.1 { slot.1 = score; }
			}
		}
		let mut hits: Vec<(Arc<Chunk>, f64)> = best
			.into_values()
			.filter(|(chunk, score)| *score > 0.0 && belongs_to_job(chunk, scope))
			.map(|(chunk, score)| (Arc::clone(chunk), score))
			.collect();
		hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.ordinal().cmp(&b.0.ordinal())));
		hits.truncate(limit);
		hits
	}

	fn score_terms<'p>(&self, parts: &[&'p Partition], terms: &[String], document: Option<&str>) -> HashMap<&'p str, (&'p Arc<Chunk>, f64)> {
		let mut scores: HashMap<&'p str, (&'p Arc<Chunk>, f64)> = HashMap::new();
		let n: usize = parts.iter().map(|p| p.len()).sum();
		if n == 0 || terms.is_empty() { return scores; }
		let total_len: u64 = parts.iter().map(|p| p.total_len()).sum();
		let avgdl = (total_len as f64 / n as f64).max(f64::EPSILON);
		let Bm25Params { k1, b } = self.params;
		for term in terms {
			let df: usize = parts.iter().map(|p| p.df(term)).sum();
			if df == 0 { continue; }
			let idf = idf(n, df);
			for segment in parts.iter().flat_map(|&p| p.segments.iter()) {
				let Some(postings) = segment.postings.get(term.as_str()) else { continue };
				for posting in postings {
					let entry = &segment.docs[posting.doc];
					if document.is_some_and(|d| entry.chunk.document_id() != d) { continue; }
					let tf = f64::from(posting.tf);
					let norm = 1.0 - b + b * f64::from(entry.len) / avgdl;
					let contribution = idf * (tf * (k1 + 1.0)) / (tf + k1 * norm);
					scores.entry(entry.chunk.id()).or_insert((&entry.chunk, 0.0)).1 += contribution;
				}
			}
		}
		scores
	}
}

/// Always positive, even for terms present in every document.
pub fn idf(n: usize, df: usize) -> f64 {
	let (n, df) = (n as f64, df as f64);
	((n - df + 0.5) / (df + 0.5) + 1.0).ln()
}

fn eligible<'a>(partitions: &'a Partitions, scope: &JobScope) -> Vec<&'a Partition> {
	match scope {
		JobScope::Job(job) => partitions.get(job).map(Arc::as_ref).into_iter().collect(),
		JobScope::All => partitions.values().map(Arc::as_ref).collect(),
	}
}

fn group_by_job<'a>(chunks: &'a [Arc<Chunk>], scope: &JobScope) -> BTreeMap<JobId, Vec<&'a Arc<Chunk>>> {
	let mut grouped: BTreeMap<JobId, Vec<&Arc<Chunk>>> = BTreeMap::new();
	for chunk in chunks.iter().filter(|c| belongs_to_job(c, scope)) {
		grouped.entry(chunk.job_id().clone()).or_default().push(chunk);
	}
	grouped
}

impl RetrievalBackend for KeywordIndex {
	fn method(&self) -> RetrievalMethod { RetrievalMethod::Keyword }

	fn index(&self, chunks: &[Arc<Chunk>]) -> Result<usize> {
		let added = self.partitions.update(|parts| {
			let mut added = 0;
			for (job, batch) in group_by_job(chunks, &JobScope::All) {
				added += Arc::make_mut(parts.entry(job).or_default()).append(batch);
			}
			Ok::<_, Error>(added)
		})?;
		debug!(added, skipped = chunks.len() - added, "Published keyword partitions");
		Ok(added)
	}

	fn rebuild(&self, scope: &JobScope, chunks: &[Arc<Chunk>]) -> Result<()> {
		let rebuilt: Partitions = group_by_job(chunks, scope)
			.into_iter()
			.map(|(job, batch)| (job, Arc::new(Partition::from_chunks(batch))))
			.collect();
		self.partitions.update(|parts| {
			match scope {
				JobScope::Job(job) => {
					parts.remove(job);
					parts.extend(rebuilt);
				}
				JobScope::All => *parts = rebuilt,
			}
			Ok::<_, Error>(())
		})?;
		debug!(scope = %scope, chunks = chunks.len(), "Rebuilt keyword index");
		Ok(())
	}

	fn remove_job(&self, job: &JobId) -> Result<usize> {
		self.partitions.update(|parts| Ok::<_, Error>(parts.remove(job).map_or(0, |p| p.len())))
	}

	fn search(&self, query: &Query, limit: usize) -> Result<Vec<RankedResult>> {
		let mut phrasings: Vec<&[String]> = vec![query.keywords.as_slice()];
		phrasings.extend(query.alternates.iter().map(Vec::as_slice));
		Ok(self
			.search_terms(&query.scope, &phrasings, query.document.as_deref(), limit)
			.into_iter()
			.map(|(chunk, score)| RankedResult { chunk_id: chunk.id().to_string(), score, method: RetrievalMethod::Keyword })
			.collect())
	}

	fn counts(&self) -> BackendCounts {
		let snapshot = self.partitions.load();
		BackendCounts {
			version: snapshot.version,
			per_job: snapshot.iter().map(|(job, p)| (job.clone(), p.len())).collect(),
		}
	}
}
