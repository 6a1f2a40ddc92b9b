use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jobrag_core::config::Settings;
use jobrag_core::store::MemoryChunkStore;
use jobrag_core::traits::{AnswerGenerator, BackendCounts, ChunkStore, Embedder, RerankCandidate, RerankJudgement, Reranker, RetrievalBackend};
use jobrag_core::types::{Chunk, ChunkDraft, JobId, JobStatus, Query, RankedResult, RetrievalMethod};
use jobrag_core::{Error, JobScope, Result};
use jobrag_embed::HashedTermEmbedder;
use jobrag_hybrid::{BackendStatus, ConfidenceLevel, Degradation, HybridEngine, QueryOptions, RelationshipGraph};
use jobrag_text::KeywordIndex;
use jobrag_vector::VectorStore;

fn job(id: &str) -> JobId { JobId::parse(id).unwrap() }

fn draft(job_id: &str, doc: &str, section: &str, idx: usize, text: &str) -> ChunkDraft {
	ChunkDraft::new(job(job_id), doc, section, text).with_index(idx)
}

fn engine() -> HybridEngine { HybridEngine::builder(Settings::default()).build().unwrap() }

async fn corpus(engine: &HybridEngine) {
	engine
		.index_batch(vec![
			draft("a", "qm-notes", "abstract", 0, "quantum entanglement basics"),
			draft("a", "qm-notes", "body", 1, "entanglement links the states of distant particles"),
			draft("a", "optics", "body", 0, "photon polarization and entanglement experiments"),
			draft("b", "mech", "body", 0, "classical mechanics review"),
			draft("b", "mech", "body", 1, "newtonian orbits"),
		])
		.await
		.unwrap();
}

#[tokio::test]
async fn scoped_queries_never_cross_jobs() {
	let engine = engine();
	corpus(&engine).await;
	let opts = QueryOptions::default();

	let a = engine.query("entanglement", &JobScope::Job(job("a")), &opts).await.unwrap();
	assert!(!a.results.is_empty());
	assert!(a.ranked_context.documents.iter().all(|d| d.job_id == job("a")));

	let b = engine.query("entanglement", &JobScope::Job(job("b")), &opts).await.unwrap();
	assert!(b.results.is_empty());
	assert_eq!(b.confidence.level, ConfidenceLevel::NoResults);

	let all = engine.query("orbits", &JobScope::All, &opts).await.unwrap();
	assert!(all.results.iter().any(|r| r.chunk_id.starts_with("b/")));
}

#[tokio::test]
async fn breakdown_reports_both_methods() {
	let engine = engine();
	corpus(&engine).await;
	let res = engine.query("quantum entanglement", &JobScope::Job(job("a")), &QueryOptions::default()).await.unwrap();
	let bd = &res.method_breakdown;
	assert_eq!(bd.backends.len(), 2);
	assert!(bd.backends.iter().all(|b| b.is_ok()));
	assert!(bd.hits(RetrievalMethod::Keyword) >= 1);
	assert!(bd.overlap >= 1);
	assert!(bd.fused >= res.results.len());
	assert_eq!(bd.phrasings[0], "quantum entanglement");
	assert!(!res.confidence.is_degraded());
	let top = &res.ranked_context.documents[0];
	assert_eq!(top.passages[0].rank, 1);
	assert!(res.ranked_context.render().contains("[qm-notes | "));
}

#[tokio::test]
async fn input_and_availability_errors() {
	let engine = engine();
	let opts = QueryOptions::default();
	assert!(matches!(engine.query("anything", &JobScope::All, &opts).await, Err(Error::IndexUnavailable(_))));

	corpus(&engine).await;
	assert!(matches!(engine.query("   ", &JobScope::All, &opts).await, Err(Error::InvalidInput(_))));
	assert!(matches!(engine.query("orbits", &JobScope::Job(job("zzz")), &opts).await, Err(Error::IndexUnavailable(_))));
	assert!(matches!(JobId::parse("bad id"), Err(Error::InvalidInput(_))));
	assert!(matches!(engine.index(draft("a", "d", "body", 0, "  ")).await, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn reindexing_twice_is_idempotent() {
	let engine = engine();
	corpus(&engine).await;
	let scope = JobScope::Job(job("a"));
	let opts = QueryOptions::default().without_rerank();

	let first = engine.reindex(&scope).unwrap();
	let status_once = engine.index_status().jobs;
	let results_once = engine.query("entanglement experiments", &scope, &opts).await.unwrap().results;

	let second = engine.reindex(&scope).unwrap();
	assert_eq!(first, second);
	assert_eq!(engine.index_status().jobs, status_once);
	assert_eq!(engine.query("entanglement experiments", &scope, &opts).await.unwrap().results, results_once);

	assert_eq!(engine.reindex(&JobScope::All).unwrap().chunks, 5);
	assert!(matches!(engine.reindex(&JobScope::Job(job("nope"))), Err(Error::NotFound(_))));
}

#[tokio::test]
async fn duplicate_chunks_are_acknowledged_once() {
	let engine = engine();
	let first = engine.index(draft("a", "d1", "body", 0, "entanglement swapping")).await.unwrap();
	assert!(first.indexed);
	let again = engine.index(draft("a", "d1", "body", 0, "entanglement swapping")).await.unwrap();
	assert!(!again.indexed);
	assert_eq!(first.chunk_id, again.chunk_id);
	assert_eq!(engine.index_status().totals.chunks, 1);
}

#[tokio::test]
async fn status_counts_per_job_and_delete_removes_everything() {
	let engine = engine();
	corpus(&engine).await;
	engine.set_job_status(&job("a"), JobStatus::Completed).unwrap();

	let status = engine.index_status();
	let a = &status.jobs[&job("a")];
	assert_eq!((a.documents, a.chunks, a.keyword_entries, a.vectors), (2, 3, 3, 3));
	assert_eq!(a.status, Some(JobStatus::Completed));
	assert_eq!(status.jobs[&job("b")].status, Some(JobStatus::Processing));
	assert_eq!(status.totals.chunks, 5);

	assert_eq!(engine.delete_job(&job("a")).unwrap(), 3);
	let status = engine.index_status();
	assert!(!status.jobs.contains_key(&job("a")));
	assert_eq!(status.totals.vectors, 2);
	assert!(matches!(engine.query("entanglement", &JobScope::Job(job("a")), &QueryOptions::default()).await, Err(Error::IndexUnavailable(_))));
	assert!(matches!(engine.delete_job(&job("a")), Err(Error::NotFound(_))));
}

#[tokio::test]
async fn store_survives_restart() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("chunks.jsonl");
	{
		let store = Arc::new(MemoryChunkStore::open(&path).unwrap());
		let engine = HybridEngine::builder(Settings::default()).store(store).build().unwrap();
		corpus(&engine).await;
	}
	let store = Arc::new(MemoryChunkStore::open(&path).unwrap());
	let engine = HybridEngine::builder(Settings::default()).store(store).build().unwrap();
	assert_eq!(engine.index_status().totals.keyword_entries, 5);
	assert_eq!(engine.job(&job("b")).map(|j| j.status), Some(JobStatus::Completed));
	let res = engine.query("orbits", &JobScope::Job(job("b")), &QueryOptions::default()).await.unwrap();
	assert!(!res.results.is_empty());

	let ack = engine.index(draft("b", "mech", "body", 2, "lagrangian formulation")).await.unwrap();
	assert!(ack.indexed);
	let ordinals: Vec<u64> = engine.store().chunks(&JobScope::All).iter().map(|c| c.ordinal()).collect();
	assert_eq!(ordinals, vec![0, 1, 2, 3, 4, 5]);
}

enum Mode {
	Fail,
	Slow,
}

struct Flaky {
	inner: VectorStore,
	mode: Mode,
}

impl Flaky {
	fn new(mode: Mode) -> Arc<Self> { Arc::new(Self { inner: VectorStore::default(), mode }) }
}

impl RetrievalBackend for Flaky {
	fn method(&self) -> RetrievalMethod { RetrievalMethod::Vector }
	fn index(&self, chunks: &[Arc<Chunk>]) -> Result<usize> { self.inner.index(chunks) }
	fn rebuild(&self, scope: &JobScope, chunks: &[Arc<Chunk>]) -> Result<()> { self.inner.rebuild(scope, chunks) }
	fn remove_job(&self, job: &JobId) -> Result<usize> { self.inner.remove_job(job) }
	fn search(&self, query: &Query, limit: usize) -> Result<Vec<RankedResult>> {
		match self.mode {
			Mode::Fail => Err(Error::backend("vector", "disk error")),
			Mode::Slow => {
				std::thread::sleep(Duration::from_millis(300));
				self.inner.search(query, limit)
			}
		}
	}
	fn counts(&self) -> BackendCounts { self.inner.counts() }
}

fn settings_with_timeout(ms: u64) -> Settings {
	let mut settings = Settings::default();
	settings.retrieval.backend_timeout_ms = ms;
	settings
}

#[tokio::test]
async fn one_failing_backend_degrades() {
	let engine = HybridEngine::builder(Settings::default())
		.backends(vec![Arc::new(KeywordIndex::default()) as Arc<dyn RetrievalBackend>, Flaky::new(Mode::Fail)])
		.build()
		.unwrap();
	corpus(&engine).await;
	let res = engine.query("entanglement", &JobScope::Job(job("a")), &QueryOptions::default()).await.unwrap();
	assert!(!res.results.is_empty());
	assert!(res.confidence.level <= ConfidenceLevel::Medium);
	assert!(res
		.confidence
		.degradations
		.iter()
		.any(|d| matches!(d, Degradation::BackendUnavailable { method: RetrievalMethod::Vector, .. })));
}

#[tokio::test]
async fn slow_backend_times_out_without_failing_the_query() {
	let engine = HybridEngine::builder(settings_with_timeout(50))
		.backends(vec![Arc::new(KeywordIndex::default()) as Arc<dyn RetrievalBackend>, Flaky::new(Mode::Slow)])
		.build()
		.unwrap();
	corpus(&engine).await;
	let res = engine.query("entanglement", &JobScope::Job(job("a")), &QueryOptions::default()).await.unwrap();
	assert!(!res.results.is_empty());
	assert!(res.method_breakdown.backends.iter().any(|b| !b.is_ok()));
}

#[tokio::test]
async fn both_backends_failing_is_an_error() {
	let failing = HybridEngine::builder(Settings::default())
		.backends(vec![Flaky::new(Mode::Fail) as Arc<dyn RetrievalBackend>, Flaky::new(Mode::Fail)])
		.build()
		.unwrap();
	corpus(&failing).await;
	let err = failing.query("entanglement", &JobScope::All, &QueryOptions::default()).await.unwrap_err();
	assert!(matches!(err, Error::Backend { .. }));

	let slow = HybridEngine::builder(settings_with_timeout(30))
		.backends(vec![Flaky::new(Mode::Slow) as Arc<dyn RetrievalBackend>, Flaky::new(Mode::Slow)])
		.build()
		.unwrap();
	corpus(&slow).await;
	let err = slow.query("entanglement", &JobScope::All, &QueryOptions::default()).await.unwrap_err();
	assert!(matches!(err, Error::RetrievalTimeout { timeout_ms: 30, .. }));
}

/// Embeds chunks immediately; once armed, every embedding call stalls.
struct StallingEmbedder {
	inner: HashedTermEmbedder,
	armed: AtomicBool,
}

#[async_trait]
impl Embedder for StallingEmbedder {
	fn id(&self) -> &str { "stalling" }
	fn dim(&self) -> usize { self.inner.dim() }
	async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
		if self.armed.load(Ordering::SeqCst) {
			tokio::time::sleep(Duration::from_millis(800)).await;
		}
		self.inner.embed_batch(texts).await
	}
}

#[tokio::test]
async fn slow_query_embedding_only_times_out_the_vector_branch() {
	let embedder = Arc::new(StallingEmbedder { inner: HashedTermEmbedder::new(64), armed: AtomicBool::new(false) });
	let engine = HybridEngine::builder(settings_with_timeout(50)).embedder(embedder.clone()).without_reranker().build().unwrap();
	corpus(&engine).await;
	embedder.armed.store(true, Ordering::SeqCst);

	let started = Instant::now();
	let res = engine.query("entanglement", &JobScope::Job(job("a")), &QueryOptions::default()).await.unwrap();
	assert!(started.elapsed() < Duration::from_millis(500));
	assert!(!res.results.is_empty());

	let backends = &res.method_breakdown.backends;
	let keyword = backends.iter().find(|b| b.method == RetrievalMethod::Keyword).unwrap();
	let vector = backends.iter().find(|b| b.method == RetrievalMethod::Vector).unwrap();
	assert!(keyword.is_ok());
	assert_eq!(vector.status, BackendStatus::TimedOut { timeout_ms: 50 });
	assert!(res.confidence.is_degraded());
}

struct Stalled;

#[async_trait]
impl Reranker for Stalled {
	fn name(&self) -> &str { "stalled" }
	async fn judge(&self, _q: &str, c: &[RerankCandidate]) -> anyhow::Result<RerankJudgement> {
		tokio::time::sleep(Duration::from_millis(500)).await;
		Ok(RerankJudgement::Ordering((0..c.len()).rev().collect()))
	}
}

#[tokio::test]
async fn reranker_timeout_returns_fused_order() {
	let mut settings = Settings::default();
	settings.rerank.timeout_ms = 20;
	let engine = HybridEngine::builder(settings).reranker(Arc::new(Stalled)).build().unwrap();
	corpus(&engine).await;
	let scope = JobScope::Job(job("a"));

	let degraded = engine.query("entanglement", &scope, &QueryOptions::default()).await.unwrap();
	let fused = engine.query("entanglement", &scope, &QueryOptions::default().without_rerank()).await.unwrap();
	assert_eq!(degraded.results, fused.results);
	assert!(!degraded.method_breakdown.reranked);
	assert!(degraded.confidence.degradations.iter().any(|d| matches!(d, Degradation::RerankerUnavailable { .. })));
	assert!(degraded.confidence.level <= ConfidenceLevel::Medium);
}

#[tokio::test]
async fn document_filter_and_related_documents() {
	let graph = Arc::new(RelationshipGraph::new());
	graph.add_citation(&job("a"), "qm-notes", "optics");
	graph.add_citation(&job("b"), "qm-notes", "mech");
	let engine = HybridEngine::builder(Settings::default()).relationships(graph).build().unwrap();
	corpus(&engine).await;

	let opts = QueryOptions::default().with_document("qm-notes");
	let res = engine.query("entanglement", &JobScope::Job(job("a")), &opts).await.unwrap();
	assert_eq!(res.ranked_context.documents.len(), 1);
	let doc = &res.ranked_context.documents[0];
	assert_eq!(doc.document_id, "qm-notes");
	let related: Vec<&str> = doc.related.iter().map(|r| r.document_id.as_str()).collect();
	assert_eq!(related, vec!["optics"]);
}

struct Echo;

#[async_trait]
impl AnswerGenerator for Echo {
	async fn generate(&self, query: &str, context: &str) -> anyhow::Result<String> {
		Ok(format!("{query}: {} context lines", context.lines().count()))
	}
}

#[tokio::test]
async fn answers_use_assembled_context() {
	let engine = HybridEngine::builder(Settings::default()).answerer(Arc::new(Echo)).build().unwrap();
	corpus(&engine).await;
	let answer = engine.answer("entanglement", &JobScope::Job(job("a")), &QueryOptions::default()).await.unwrap();
	assert!(answer.text.starts_with("entanglement: "));

	let empty = engine.answer("entanglement", &JobScope::Job(job("b")), &QueryOptions::default()).await.unwrap();
	assert!(empty.response.results.is_empty());
	assert!(empty.text.starts_with("No relevant passages"));

	assert!(matches!(crate::engine().answer("x", &JobScope::All, &QueryOptions::default()).await, Err(Error::InvalidConfig(_))));
}

/// Keyword index that checks every published chunk is already readable from the store.
struct StoreFirst {
	inner: KeywordIndex,
	store: Arc<MemoryChunkStore>,
	fail: bool,
}

impl RetrievalBackend for StoreFirst {
	fn method(&self) -> RetrievalMethod { RetrievalMethod::Keyword }
	fn index(&self, chunks: &[Arc<Chunk>]) -> Result<usize> {
		if self.fail { return Err(Error::backend("keyword", "segment write failed")); }
		if let Some(missing) = chunks.iter().find(|c| self.store.get(c.id()).is_none()) {
			return Err(Error::backend("keyword", format!("{} published before it was stored", missing.id())));
		}
		self.inner.index(chunks)
	}
	fn rebuild(&self, scope: &JobScope, chunks: &[Arc<Chunk>]) -> Result<()> { self.inner.rebuild(scope, chunks) }
	fn remove_job(&self, job: &JobId) -> Result<usize> { self.inner.remove_job(job) }
	fn search(&self, query: &Query, limit: usize) -> Result<Vec<RankedResult>> { self.inner.search(query, limit) }
	fn counts(&self) -> BackendCounts { self.inner.counts() }
}

fn store_first_engine(fail: bool) -> (HybridEngine, Arc<MemoryChunkStore>) {
	let store = Arc::new(MemoryChunkStore::new());
	let backend = Arc::new(StoreFirst { inner: KeywordIndex::default(), store: Arc::clone(&store), fail });
	let engine = HybridEngine::builder(Settings::default())
		.store(store.clone())
		.backends(vec![backend as Arc<dyn RetrievalBackend>, Arc::new(VectorStore::default())])
		.build()
		.unwrap();
	(engine, store)
}

#[tokio::test]
async fn chunks_are_stored_before_backends_see_them() {
	let (engine, store) = store_first_engine(false);
	corpus(&engine).await;
	assert_eq!(store.len(), 5);
	let res = engine.query("entanglement", &JobScope::Job(job("a")), &QueryOptions::default()).await.unwrap();
	assert!(res.method_breakdown.backends.iter().all(|b| b.is_ok()));
}

#[tokio::test]
async fn failed_publish_withdraws_chunks_from_the_store() {
	let (engine, store) = store_first_engine(true);
	let err = engine.index(draft("a", "d1", "body", 0, "entanglement swapping")).await.unwrap_err();
	assert!(matches!(err, Error::Backend { .. }));
	assert!(store.is_empty());
	assert_eq!(engine.job(&job("a")).map(|j| j.status), Some(JobStatus::Failed));
	assert_eq!(engine.index_status().totals.vectors, 0);
}

#[tokio::test]
async fn start_job_resets_a_finished_job() {
	let engine = engine();
	engine.start_job(&job("fresh"));
	assert_eq!(engine.job(&job("fresh")).map(|j| j.status), Some(JobStatus::Processing));

	corpus(&engine).await;
	engine.set_job_status(&job("a"), JobStatus::Completed).unwrap();
	engine.start_job(&job("a"));
	assert_eq!(engine.job(&job("a")).map(|j| j.status), Some(JobStatus::Processing));
}
