use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use jobrag_core::config::VectorSettings;
use jobrag_core::snapshot::SnapshotCell;
use jobrag_core::traits::{BackendCounts, RetrievalBackend};
use jobrag_core::types::{validate_vector, Chunk, ChunkId, JobId, Query, RankedResult, RetrievalMethod};
use jobrag_core::{belongs_to_job, Error, JobScope, JobScoped, Result};
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry {
	chunk: Arc<Chunk>,
	norm: f32,
}

/// Vectors published together; never mutated once shared.
#[derive(Debug, Default)]
struct Segment {
	entries: Vec<Entry>,
	ids: HashSet<ChunkId>,
}

impl Segment {
	fn push(&mut self, chunk: &Arc<Chunk>) -> bool {
		if !self.ids.insert(chunk.id().to_string()) { return false; }
		let norm = chunk.embedding().map_or(0.0, norm);
		self.entries.push(Entry { chunk: Arc::clone(chunk), norm });
		true
	}
}

/// A job's vectors as shared segments, oldest first. Trailing segments merge
/// while the newer is at least half the older, so a partition holds
/// logarithmically many segments and a write copies only pointers.
#[derive(Debug, Clone, Default)]
struct Partition {
	segments: Vec<Arc<Segment>>,
}

impl Partition {
	fn len(&self) -> usize { self.segments.iter().map(|s| s.entries.len()).sum() }

	fn entries(&self) -> impl Iterator<Item = &Entry> { self.segments.iter().flat_map(|s| s.entries.iter()) }

	fn append<'a>(&mut self, batch: impl IntoIterator<Item = &'a Arc<Chunk>>) -> usize {
		let mut segment = Segment::default();
		for chunk in batch {
			if self.segments.iter().any(|s| s.ids.contains(chunk.id())) { continue; }
			segment.push(chunk);
		}
		let added = segment.entries.len();
		if added == 0 { return 0; }
		self.segments.push(Arc::new(segment));
		while let [.., older, newer] = self.segments.as_slice() {
			if newer.entries.len() * 2 < older.entries.len() { break; }
			let mut merged = Segment::default();
			for entry in older.entries.iter().chain(&newer.entries) {
				merged.ids.insert(entry.chunk.id().to_string());
				merged.entries.push(entry.clone());
			}
			self.segments.truncate(self.segments.len() - 2);
			self.segments.push(Arc::new(merged));
		}
		added
	}
}

#[derive(Debug, Clone, Default)]
struct State {
	dim: Option<usize>,
	partitions: BTreeMap<JobId, Arc<Partition>>,
}

impl State {
	/// Checks a batch against the store dimension before anything is written.
	fn admit(&mut self, chunks: &[&Arc<Chunk>]) -> Result<()> {
		for chunk in chunks {
			let vector = chunk.embedding().ok_or_else(|| Error::invalid_input(format!("chunk {} has no embedding", chunk.id())))?;
			validate_vector(vector)?;
			match self.dim {
				Some(dim) if dim != vector.len() => {
					return Err(Error::invalid_input(format!("chunk {} has dimension {}, store expects {dim}", chunk.id(), vector.len())));
				}
				Some(_) => {}
				None => self.dim = Some(vector.len()),
			}
		}
		Ok(())
	}
}

fn norm(v: &[f32]) -> f32 { v.iter().map(|x| x * x).sum::<f32>().sqrt() }

/// Cosine similarity store, one immutable partition per job.
///
/// Similarity is computed over the job-filtered subset only; matches below
/// the threshold are dropped and ties fall back to insertion order.
pub struct VectorStore {
	threshold: f32,
	state: SnapshotCell<State>,
}

impl Default for VectorStore {
	fn default() -> Self { Self::new(VectorSettings::default().similarity_threshold) }
}

impl VectorStore {
	pub fn new(threshold: f32) -> Self { Self { threshold, state: SnapshotCell::default() } }

	pub fn from_settings(settings: &VectorSettings) -> Self { Self::new(settings.similarity_threshold) }

	pub fn threshold(&self) -> f32 { self.threshold }

	pub fn dim(&self) -> Option<usize> { self.state.load().dim }

	pub fn search_vector(&self, scope: &JobScope, query: &[f32], limit: usize, threshold: f32, document: Option<&str>) -> Result<Vec<(Arc<Chunk>, f32)>> {
		validate_vector(query)?;
		let snapshot = self.state.load();
		if let Some(dim) = snapshot.dim {
			if dim != query.len() {
				return Err(Error::invalid_input(format!("query has dimension {}, store expects {dim}", query.len())));
			}
		}
		let qn = norm(query);
		if qn == 0.0 {
			return Err(Error::invalid_input("query embedding has zero magnitude"));
		}
		let partitions: Vec<&Arc<Partition>> = match scope {
			JobScope::Job(job) => snapshot.partitions.get(job).into_iter().collect(),
			JobScope::All => snapshot.partitions.values().collect(),
		};
		let mut hits = Vec::new();
		for entry in partitions.iter().flat_map(|p| p.entries()) {
			if !belongs_to_job(&entry.chunk, scope) { continue; }
			if document.is_some_and(|d| entry.chunk.document_id() != d) { continue; }
			let Some(vector) = entry.chunk.embedding() else { continue };
			if entry.norm == 0.0 { continue; }
			let dot: f32 = vector.iter().zip(query).map(|(a, b)| a * b).sum();
			let similarity = dot / (qn * entry.norm);
			if similarity >= threshold { hits.push((Arc::clone(&entry.chunk), similarity)); }
		}
		hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.ordinal().cmp(&b.0.ordinal())));
		hits.truncate(limit);
		Ok(hits)
	}
}

fn group_by_job<'a>(chunks: &'a [Arc<Chunk>], scope: &JobScope) -> BTreeMap<JobId, Vec<&'a Arc<Chunk>>> {
	let mut grouped: BTreeMap<JobId, Vec<&Arc<Chunk>>> = BTreeMap::new();
	for chunk in chunks.iter().filter(|c| belongs_to_job(c, scope)) {
		grouped.entry(chunk.job_id().clone()).or_default().push(chunk);
	}
	grouped
}

impl RetrievalBackend for VectorStore {
	fn method(&self) -> RetrievalMethod { RetrievalMethod::Vector }

	fn index(&self, chunks: &[Arc<Chunk>]) -> Result<usize> {
		let added = self.state.update(|state| {
			let grouped = group_by_job(chunks, &JobScope::All);
			state.admit(&grouped.values().flatten().copied().collect::<Vec<_>>())?;
			let mut added = 0;
			for (job, batch) in grouped {
				added += Arc::make_mut(state.partitions.entry(job).or_default()).append(batch);
			}
			Ok::<_, Error>(added)
		})?;
		debug!(added, "Published vector partitions");
		Ok(added)
	}

	fn rebuild(&self, scope: &JobScope, chunks: &[Arc<Chunk>]) -> Result<()> {
		self.state.update(|state| {
			let grouped = group_by_job(chunks, scope);
			let mut next = match scope {
				JobScope::Job(job) => {
					let mut kept = state.clone();
					kept.partitions.remove(job);
					if kept.partitions.is_empty() { kept.dim = None; }
					kept
				}
				JobScope::All => State::default(),
			};
			next.admit(&grouped.values().flatten().copied().collect::<Vec<_>>())?;
			for (job, batch) in grouped {
				let mut partition = Partition::default();
				partition.append(batch);
				next.partitions.insert(job, Arc::new(partition));
			}
			*state = next;
			Ok::<_, Error>(())
		})?;
		debug!(scope = %scope, chunks = chunks.len(), "Rebuilt vector store");
		Ok(())
	}

	fn remove_job(&self, job: &JobId) -> Result<usize> {
		self.state.update(|state| {
			let removed = state.partitions.remove(job).map_or(0, |p| p.len());
			if state.partitions.is_empty() { state.dim = None; }
			Ok::<_, Error>(removed)
		})
	}

	fn search(&self, query: &Query, limit: usize) -> Result<Vec<RankedResult>> {
		let embedding = query.embedding.as_deref().ok_or_else(|| Error::invalid_input("query has no embedding"))?;
		Ok(self
			.search_vector(&query.scope, embedding, limit, self.threshold, query.document.as_deref())?
			.into_iter()
			.map(|(chunk, similarity)| RankedResult { chunk_id: chunk.id().to_string(), score: f64::from(similarity), method: RetrievalMethod::Vector })
			.collect())
	}

	fn counts(&self) -> BackendCounts {
		let snapshot = self.state.load();
		BackendCounts {
			version: snapshot.version,
			per_job: snapshot.partitions.iter().map(|(job, p)| (job.clone(), p.len())).collect(),
		}
	}
}
