use std::sync::{PoisonError, RwLock};

use jobrag_core::traits::RelationshipLookup;
use jobrag_core::types::{DocumentId, JobId, RelatedDocument};
use jobrag_core::{belongs_to_job, JobScope};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Citation {
	job: JobId,
	citing: DocumentId,
	cited: DocumentId,
}

/// In-memory citation graph used to enrich context with related documents.
///
/// Lookups only ever return documents of the job they were asked about.
#[derive(Debug, Default)]
pub struct RelationshipGraph {
	edges: RwLock<Vec<Citation>>,
}

impl RelationshipGraph {
	pub fn new() -> Self { Self::default() }

	/// Record that `citing` cites `cited`, both inside `job`. Repeats are ignored.
	pub fn add_citation(&self, job: &JobId, citing: impl Into<DocumentId>, cited: impl Into<DocumentId>) {
		let edge = Citation { job: job.clone(), citing: citing.into(), cited: cited.into() };
		let mut edges = self.edges.write().unwrap_or_else(PoisonError::into_inner);
		if !edges.contains(&edge) { edges.push(edge); }
	}

	pub fn remove_job(&self, job: &JobId) -> usize {
		let mut edges = self.edges.write().unwrap_or_else(PoisonError::into_inner);
		let before = edges.len();
		edges.retain(|e| &e.job != job);
		before - edges.len()
	}

	pub fn len(&self) -> usize { self.edges.read().unwrap_or_else(PoisonError::into_inner).len() }

	pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl RelationshipLookup for RelationshipGraph {
	fn related(&self, document_id: &str, job_id: &JobId) -> anyhow::Result<Vec<RelatedDocument>> {
		let scope = JobScope::Job(job_id.clone());
		let edges = self.edges.read().unwrap_or_else(PoisonError::into_inner);
		let mut out: Vec<RelatedDocument> = Vec::new();
		for edge in edges.iter() {
			let related = if edge.citing == document_id {
				RelatedDocument { document_id: edge.cited.clone(), job_id: edge.job.clone(), relation: "cites".into() }
			} else if edge.cited == document_id {
				RelatedDocument { document_id: edge.citing.clone(), job_id: edge.job.clone(), relation: "cited_by".into() }
			} else {
				continue;
			};
			if belongs_to_job(&related, &scope) && !out.contains(&related) { out.push(related); }
		}
		Ok(out)
	}
}
