//! jobrag-hybrid
//!
//! Combines the keyword and vector backends behind one job-scoped query
//! surface: rank fusion, reranking with graceful degradation, and context
//! assembly with provenance.
pub mod aggregate;
pub mod engine;
pub mod fusion;
pub mod graph;
pub mod rerank;
pub mod response;

pub use aggregate::{AssembledContext, Aggregator, ContextPassage, DocumentContext};
pub use engine::{HybridEngine, HybridEngineBuilder};
pub use fusion::{reciprocal_rank_fusion, RRF_K};
pub use graph::RelationshipGraph;
pub use rerank::{Candidate, HeuristicReranker, HttpReranker, RerankAdapter, RerankOutcome};
pub use response::{
	Answer, BackendReport, BackendStatus, BatchAck, ConfidenceLevel, ConfidenceSignal, Degradation, IndexAck, IndexStatus, JobIndexStatus,
	MethodBreakdown, QueryOptions, QueryResponse, ReindexReport,
};
