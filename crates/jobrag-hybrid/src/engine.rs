//! The hybrid retrieval engine.
//!
//! Query path: preprocess -> keyword and vector search in parallel -> RRF ->
//! guard post-check -> rerank (timeout-bounded) -> aggregate. Index path:
//! embed -> insert into the chunk store -> publish to every backend -> flush.
//! A chunk is in the store before any backend can return it.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use jobrag_core::config::Settings;
use jobrag_core::store::MemoryChunkStore;
use jobrag_core::traits::{AnswerGenerator, ChunkStore, Embedder, RelationshipLookup, Reranker, RetrievalBackend};
use jobrag_core::types::{Chunk, ChunkDraft, ChunkId, Job, JobId, JobStatus, Query, RankedResult, RelatedDocument, RetrievalMethod};
use jobrag_core::{belongs_to_job, Error, JobScope, JobScoped, Result};
use jobrag_embed::get_default_embedder;
use jobrag_text::{Analyzer, Bm25Params, KeywordIndex, QueryPreprocessor};
use jobrag_vector::VectorStore;

use crate::aggregate::Aggregator;
use crate::fusion::reciprocal_rank_fusion;
use crate::rerank::{Candidate, RerankAdapter};
use crate::response::{
	Answer, BackendReport, BackendStatus, BatchAck, ConfidenceSignal, Degradation, IndexAck, IndexStatus, MethodBreakdown, QueryOptions,
	QueryResponse, ReindexReport,
};

/// Related documents attached per context document.
const MAX_RELATED: usize = 3;

const NO_CONTEXT_ANSWER: &str = "No relevant passages were found for this question.";

pub struct HybridEngine {
	store: Arc<dyn ChunkStore>,
	backends: Vec<Arc<dyn RetrievalBackend>>,
	embedder: Arc<dyn Embedder>,
	preprocessor: QueryPreprocessor,
	reranker: RerankAdapter,
	aggregator: Aggregator,
	relationships: Option<Arc<dyn RelationshipLookup>>,
	answerer: Option<Arc<dyn AnswerGenerator>>,
	jobs: RwLock<BTreeMap<JobId, Job>>,
	next_ordinal: AtomicU64,
	writer: Mutex<()>,
	backend_timeout: Duration,
	defaults: QueryOptions,
}

#[derive(Default)]
pub struct HybridEngineBuilder {
	settings: Settings,
	store: Option<Arc<dyn ChunkStore>>,
	backends: Option<Vec<Arc<dyn RetrievalBackend>>>,
	embedder: Option<Arc<dyn Embedder>>,
	reranker: Option<RerankAdapter>,
	relationships: Option<Arc<dyn RelationshipLookup>>,
	answerer: Option<Arc<dyn AnswerGenerator>>,
}

impl HybridEngineBuilder {
	pub fn store(mut self, store: Arc<dyn ChunkStore>) -> Self { self.store = Some(store); self }

	/// Replace the default keyword + vector pair.
	pub fn backends(mut self, backends: Vec<Arc<dyn RetrievalBackend>>) -> Self { self.backends = Some(backends); self }

	pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self { self.embedder = Some(embedder); self }

	pub fn reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
		self.reranker = Some(RerankAdapter::new(reranker, self.settings.rerank.top_n, self.settings.rerank.timeout_ms));
		self
	}

	pub fn without_reranker(mut self) -> Self { self.reranker = Some(RerankAdapter::disabled()); self }

	pub fn relationships(mut self, lookup: Arc<dyn RelationshipLookup>) -> Self { self.relationships = Some(lookup); self }

	pub fn answerer(mut self, answerer: Arc<dyn AnswerGenerator>) -> Self { self.answerer = Some(answerer); self }

	pub fn build(self) -> Result<HybridEngine> {
		let settings = self.settings;
		settings.validate()?;
		let store = self.store.unwrap_or_else(|| Arc::new(MemoryChunkStore::new()));
		let backends = self.backends.unwrap_or_else(|| {
			vec![
				Arc::new(KeywordIndex::new(Bm25Params::from(&settings.keyword))) as Arc<dyn RetrievalBackend>,
				Arc::new(VectorStore::from_settings(&settings.vector)),
			]
		});
		if backends.is_empty() {
			return Err(Error::InvalidConfig("at least one retrieval backend is required".into()));
		}
		let embedder = match self.embedder {
			Some(e) => e,
			None => get_default_embedder(&settings.embed).map_err(|e| Error::InvalidConfig(e.to_string()))?,
		};
		let reranker = match self.reranker {
			Some(r) => r,
			None => RerankAdapter::from_settings(&settings.rerank).map_err(|e| Error::InvalidConfig(e.to_string()))?,
		};
		let preprocessor = QueryPreprocessor::new(Analyzer::new(), settings.preprocess.expansion_limit)?;
		let defaults = QueryOptions {
			top_k: settings.retrieval.final_top_k,
			candidate_limit: settings.retrieval.candidate_limit,
			..QueryOptions::default()
		};

		let existing = store.chunks(&JobScope::All);
		let next = existing.iter().map(|c| c.ordinal() + 1).max().unwrap_or(0);
		let engine = HybridEngine {
			store,
			backends,
			embedder,
			preprocessor,
			reranker,
			aggregator: Aggregator::new(settings.aggregate.clone()),
			relationships: self.relationships,
			answerer: self.answerer,
			jobs: RwLock::new(BTreeMap::new()),
			next_ordinal: AtomicU64::new(next),
			writer: Mutex::new(()),
			backend_timeout: Duration::from_millis(settings.retrieval.backend_timeout_ms),
			defaults,
		};
		if !existing.is_empty() {
			for backend in &engine.backends { backend.rebuild(&JobScope::All, &existing)?; }
			for job in engine.store.jobs() { engine.register_job(&job, JobStatus::Completed); }
			info!(chunks = existing.len(), "Rebuilt indexes from chunk store");
		}
		Ok(engine)
	}
}

fn method_name(method: RetrievalMethod) -> String { method.to_string() }

impl HybridEngine {
	pub fn builder(settings: Settings) -> HybridEngineBuilder { HybridEngineBuilder { settings, ..Default::default() } }

	/// Engine with default collaborators for `settings`.
	pub fn new(settings: Settings) -> Result<Self> { Self::builder(settings).build() }

	pub fn default_options(&self) -> QueryOptions { self.defaults.clone() }

	pub fn store(&self) -> &Arc<dyn ChunkStore> { &self.store }

	pub fn embedder(&self) -> &Arc<dyn Embedder> { &self.embedder }

	// ---- jobs ----

	/// Register `job` if unknown; an existing entry keeps its status.
	pub fn register_job(&self, job: &JobId, status: JobStatus) {
		let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
		jobs.entry(job.clone()).or_insert_with(|| Job::new(job.clone(), status));
	}

	/// Mark `job` as Processing for a new ingest, registering it if unknown.
	pub fn start_job(&self, job: &JobId) {
		let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
		let entry = jobs.entry(job.clone()).or_insert_with(|| Job::new(job.clone(), JobStatus::Processing));
		entry.status = JobStatus::Processing;
		entry.updated_at = chrono::Utc::now();
	}

	pub fn set_job_status(&self, job: &JobId, status: JobStatus) -> Result<()> {
		let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
		let entry = jobs.get_mut(job).ok_or_else(|| Error::NotFound(format!("job {job}")))?;
		entry.status = status;
		entry.updated_at = chrono::Utc::now();
		Ok(())
	}

	pub fn job(&self, job: &JobId) -> Option<Job> { self.jobs.read().unwrap_or_else(PoisonError::into_inner).get(job).cloned() }

	fn knows_job(&self, job: &JobId) -> bool {
		self.jobs.read().unwrap_or_else(PoisonError::into_inner).contains_key(job) || self.store.jobs().contains(job)
	}

	// ---- indexing ----

	pub async fn index(&self, draft: ChunkDraft) -> Result<IndexAck> {
		let ack = self.index_batch(vec![draft]).await?;
		let chunk_id = ack.chunk_ids.into_iter().next().ok_or_else(|| Error::Operation("empty acknowledgement".into()))?;
		Ok(IndexAck { chunk_id, indexed: ack.indexed == 1 })
	}

	/// Index a batch of chunks. Chunks already stored are acknowledged but
	/// skipped. The batch becomes visible to queries all at once per backend.
	pub async fn index_batch(&self, drafts: Vec<ChunkDraft>) -> Result<BatchAck> {
		let mut ack = BatchAck::default();
		let mut fresh: Vec<(ChunkId, ChunkDraft)> = Vec::new();
		let mut batch_ids: HashSet<ChunkId> = HashSet::new();
		for draft in drafts {
			draft.validate()?;
			let id = draft.chunk_id();
			ack.chunk_ids.push(id.clone());
			if self.store.get(&id).is_some() || !batch_ids.insert(id.clone()) {
				ack.skipped += 1;
				continue;
			}
			fresh.push((id, draft));
		}
		if fresh.is_empty() { return Ok(ack); }

		let texts: Vec<String> = fresh.iter().map(|(_, d)| d.text.clone()).collect();
		let vectors = self.embedder.embed_batch(&texts).await.map_err(|e| Error::backend(format!("embedder {}", self.embedder.id()), e))?;
		if vectors.len() != texts.len() {
			return Err(Error::backend(
				format!("embedder {}", self.embedder.id()),
				format!("returned {} vectors for {} texts", vectors.len(), texts.len()),
			));
		}

		let base = self.next_ordinal.fetch_add(fresh.len() as u64, Ordering::SeqCst);
		let mut chunks: Vec<Arc<Chunk>> = Vec::with_capacity(fresh.len());
		for (i, ((_, draft), vector)) in fresh.into_iter().zip(vectors).enumerate() {
			let tokens = self.preprocessor.analyzer().tokenize(&draft.text);
			chunks.push(Arc::new(Chunk::from_draft(draft, tokens, Some(vector), base + i as u64)?));
		}
		let touched: BTreeSet<JobId> = chunks.iter().map(|c| c.job_id().clone()).collect();
		for job in &touched { self.register_job(job, JobStatus::Processing); }

		let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
		let mut stored = Vec::with_capacity(chunks.len());
		for chunk in chunks {
			if self.store.insert(Arc::clone(&chunk))? { stored.push(chunk); } else { ack.skipped += 1; }
		}
		if let Err(err) = self.publish(&stored) {
			warn!(error = %err, jobs = touched.len(), "Indexing failed; restoring affected jobs");
			let ids: Vec<ChunkId> = stored.iter().map(|c| c.id().to_string()).collect();
			if let Err(e) = self.store.remove(&ids) { warn!(error = %e, "Could not withdraw chunks from store"); }
			for job in &touched {
				let scope = JobScope::Job(job.clone());
				let kept = self.store.chunks(&scope);
				for backend in &self.backends {
					if let Err(e) = backend.rebuild(&scope, &kept) { warn!(job = %job, error = %e, "Restore failed"); }
				}
				let _ = self.set_job_status(job, JobStatus::Failed);
			}
			return Err(err);
		}
		ack.indexed = stored.len();
		self.store.flush()?;
		debug!(indexed = ack.indexed, skipped = ack.skipped, "Indexed batch");
		Ok(ack)
	}

	fn publish(&self, chunks: &[Arc<Chunk>]) -> Result<()> {
		for backend in &self.backends {
			let added = backend.index(chunks)?;
			debug!(method = %backend.method(), added, "Published to backend");
		}
		Ok(())
	}

	/// Rebuild every backend for `scope` from the chunk store.
	pub fn reindex(&self, scope: &JobScope) -> Result<ReindexReport> {
		if let JobScope::Job(job) = scope {
			if !self.knows_job(job) { return Err(Error::NotFound(format!("job {job}"))); }
		}
		let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
		let chunks = self.store.chunks(scope);
		for backend in &self.backends { backend.rebuild(scope, &chunks)?; }
		let jobs: BTreeSet<&JobId> = chunks.iter().map(|c| c.job_id()).collect();
		info!(scope = %scope, chunks = chunks.len(), "Reindexed");
		Ok(ReindexReport { scope: scope.clone(), jobs: jobs.len(), chunks: chunks.len() })
	}

	/// Remove a job from the store, every backend and the job registry.
	pub fn delete_job(&self, job: &JobId) -> Result<usize> {
		if !self.knows_job(job) { return Err(Error::NotFound(format!("job {job}"))); }
		let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
		for backend in &self.backends { backend.remove_job(job)?; }
		let removed = self.store.remove_job(job)?;
		self.store.flush()?;
		self.jobs.write().unwrap_or_else(PoisonError::into_inner).remove(job);
		info!(job = %job, chunks = removed, "Deleted job");
		Ok(removed)
	}

	pub fn index_status(&self) -> IndexStatus {
		let mut status = IndexStatus::default();
		for (id, job) in self.jobs.read().unwrap_or_else(PoisonError::into_inner).iter() {
			status.jobs.entry(id.clone()).or_default().status = Some(job.status);
		}
		for document in self.store.documents(&JobScope::All) {
			let entry = status.jobs.entry(document.job_id).or_default();
			entry.documents += 1;
			entry.chunks += document.chunk_ids.len();
		}
		for backend in &self.backends {
			let counts = backend.counts();
			*status.versions.entry(backend.method()).or_default() = counts.version;
			for (job, n) in counts.per_job {
				let entry = status.jobs.entry(job).or_default();
				match backend.method() {
					RetrievalMethod::Keyword => entry.keyword_entries += n,
					RetrievalMethod::Vector => entry.vectors += n,
				}
			}
		}
		for job in status.jobs.values() {
			status.totals.documents += job.documents;
			status.totals.chunks += job.chunks;
			status.totals.keyword_entries += job.keyword_entries;
			status.totals.vectors += job.vectors;
		}
		status
	}

	// ---- querying ----

	fn indexed_in(&self, scope: &JobScope) -> usize {
		self.backends
			.iter()
			.map(|b| {
				let counts = b.counts();
				match scope {
					JobScope::Job(job) => counts.per_job.get(job).copied().unwrap_or(0),
					JobScope::All => counts.total(),
				}
			})
			.sum()
	}

	async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
		self.embedder.embed(text).await.map_err(|e| Error::backend(format!("embedder {}", self.embedder.id()), e))
	}

	/// Search every backend in parallel, each under the backend timeout. The
	/// query embedding is computed inside the vector branch, once, so keyword
	/// search never waits on the embedder.
	async fn run_backends(&self, query: &Query, limit: usize) -> Vec<(BackendReport, Result<Vec<RankedResult>>)> {
		let timeout_ms = self.backend_timeout.as_millis() as u64;
		let embedding: OnceCell<Vec<f32>> = OnceCell::new();
		let tasks = self.backends.iter().map(|backend| {
			let embedding = &embedding;
			let method = backend.method();
			async move {
				let started = Instant::now();
				let search = async {
					let mut query = query.clone();
					if method == RetrievalMethod::Vector && query.embedding.is_none() {
						let vector = embedding.get_or_try_init(|| self.embed_query(&query.text)).await?;
						query.embedding = Some(vector.clone());
					}
					let backend = Arc::clone(backend);
					tokio::task::spawn_blocking(move || backend.search(&query, limit))
						.await
						.map_err(|join| Error::backend(method_name(method), join))?
				};
				let outcome = match tokio::time::timeout(self.backend_timeout, search).await {
					Err(_) => Err(Error::RetrievalTimeout { backend: method_name(method), timeout_ms }),
					Ok(result) => result,
				};
				let elapsed_ms = started.elapsed().as_millis() as u64;
				let (hits, status) = match &outcome {
					Ok(hits) => (hits.len(), BackendStatus::Ok),
					Err(Error::RetrievalTimeout { timeout_ms, .. }) => (0, BackendStatus::TimedOut { timeout_ms: *timeout_ms }),
					Err(err) => (0, BackendStatus::Failed { reason: err.to_string() }),
				};
				(BackendReport { method, hits, status, elapsed_ms }, outcome)
			}
		});
		join_all(tasks).await
	}

	/// Answer-ready context for `question` under `scope`.
	pub async fn query(&self, question: &str, scope: &JobScope, options: &QueryOptions) -> Result<QueryResponse> {
		let question = question.trim();
		if question.is_empty() { return Err(Error::invalid_input("question is empty")); }
		if options.top_k == 0 || options.candidate_limit == 0 {
			return Err(Error::invalid_input("top_k and candidate_limit must be positive"));
		}
		if self.indexed_in(scope) == 0 {
			return Err(Error::IndexUnavailable(format!("nothing indexed for {scope}")));
		}

		let pre = self.preprocessor.preprocess(question, options.expand);
		let query = Query {
			text: pre.text.clone(),
			scope: scope.clone(),
			keywords: pre.keywords.clone(),
			alternates: pre.alternates.clone(),
			embedding: None,
			document: options.document.clone(),
		};

		let mut breakdown = MethodBreakdown { phrasings: pre.phrasings.clone(), intents: pre.intents.clone(), ..Default::default() };
		let mut degradations = Vec::new();
		let mut lists = Vec::new();
		let mut failures = Vec::new();
		for (report, outcome) in self.run_backends(&query, options.candidate_limit).await {
			match outcome {
				Ok(hits) => lists.push(hits),
				Err(err) => {
					warn!(method = %report.method, error = %err, "Retrieval backend unavailable");
					degradations.push(Degradation::BackendUnavailable { method: report.method, reason: err.to_string() });
					failures.push(err);
				}
			}
			breakdown.backends.push(report);
		}
		if lists.is_empty() {
			return Err(if failures.iter().all(Error::is_timeout) {
				failures.into_iter().next().unwrap_or_else(|| Error::IndexUnavailable(format!("no backend answered for {scope}")))
			} else {
				Error::Backend {
					backend: "all".into(),
					message: failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "),
				}
			});
		}

		let fused = reciprocal_rank_fusion(&lists);
		breakdown.fused = fused.len();
		breakdown.overlap = fused.iter().filter(|f| f.contributions.len() > 1).count();

		let mut candidates = Vec::with_capacity(fused.len());
		for result in fused {
			let Some(chunk) = self.store.get(&result.chunk_id) else { continue };
			if !belongs_to_job(&chunk, scope) {
				warn!(chunk = %result.chunk_id, scope = %scope, "Dropped out-of-scope result");
				continue;
			}
			candidates.push(Candidate { fused: result, chunk });
		}

		let ranked = if options.rerank && self.reranker.is_enabled() {
			let outcome = self.reranker.rerank(&pre.text, candidates).await;
			breakdown.reranked = outcome.reranked;
			if let Some(reason) = outcome.degraded { degradations.push(Degradation::RerankerUnavailable { reason }); }
			outcome.candidates
		} else {
			candidates
		};

		let mut context = self.aggregator.assemble(&ranked, options.top_k);
		breakdown.deduplicated = context.deduplicated;
		if options.include_related {
			if let Some(lookup) = &self.relationships {
				for doc in context.documents.iter_mut() {
					doc.related = related_documents(lookup.as_ref(), &doc.document_id, &doc.job_id, scope);
				}
			}
		}

		let results = context.selected().to_vec();
		let agreement = if results.is_empty() {
			0.0
		} else {
			results.iter().filter(|r| r.contributions.len() > 1).count() as f64 / results.len() as f64
		};
		let confidence = ConfidenceSignal::assess(context.documents.len(), results.len(), agreement, degradations);
		debug!(
			scope = %scope,
			fused = breakdown.fused,
			kept = results.len(),
			confidence = ?confidence.level,
			"Query complete"
		);
		Ok(QueryResponse {
			query: question.to_string(),
			scope: scope.clone(),
			ranked_context: context,
			results,
			method_breakdown: breakdown,
			confidence,
		})
	}

	/// Run a query and hand the assembled context to the answer generator.
	pub async fn answer(&self, question: &str, scope: &JobScope, options: &QueryOptions) -> Result<Answer> {
		let answerer = self.answerer.as_ref().ok_or_else(|| Error::InvalidConfig("no answer generator configured".into()))?;
		let response = self.query(question, scope, options).await?;
		if response.ranked_context.is_empty() {
			return Ok(Answer { text: NO_CONTEXT_ANSWER.to_string(), response });
		}
		let text = answerer
			.generate(&response.query, &response.ranked_context.render())
			.await
			.map_err(|e| Error::backend("answer generator", e))?;
		Ok(Answer { text, response })
	}
}

fn related_documents(lookup: &dyn RelationshipLookup, document_id: &str, job: &JobId, scope: &JobScope) -> Vec<RelatedDocument> {
	let own = JobScope::Job(job.clone());
	match lookup.related(document_id, job) {
		Ok(found) => found
			.into_iter()
			.filter(|r| belongs_to_job(r, &own) && belongs_to_job(r, scope) && r.document_id != document_id)
			.take(MAX_RELATED)
			.collect(),
		Err(err) => {
			warn!(document = document_id, error = %err, "Relationship lookup failed");
			Vec::new()
		}
	}
}
