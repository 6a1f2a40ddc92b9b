//! Job isolation guard.
//!
//! Every query runs under a [`JobScope`]. Backends filter on it while scoring,
//! and the engine re-checks every result with [`belongs_to_job`] before it is
//! returned. A scoped query never widens to the whole corpus.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::JobId;

/// Partition a request may see.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "scope", content = "job")]
pub enum JobScope {
    Job(JobId),
    /// Explicit opt-in to corpus-wide retrieval.
    All,
}

impl JobScope {
    pub fn from_option(job: Option<JobId>) -> Self {
        job.map_or(Self::All, Self::Job)
    }

    pub fn job(&self) -> Option<&JobId> {
        match self {
            Self::Job(id) => Some(id),
            Self::All => None,
        }
    }

    pub fn admits(&self, job_id: &JobId) -> bool {
        match self {
            Self::Job(id) => id == job_id,
            Self::All => true,
        }
    }
}

impl std::fmt::Display for JobScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Job(id) => write!(f, "job:{id}"),
            Self::All => f.write_str("all"),
        }
    }
}

/// Anything that carries the job it was indexed under.
pub trait JobScoped {
    fn job_id(&self) -> &JobId;
}

impl<T: JobScoped + ?Sized> JobScoped for &T {
    fn job_id(&self) -> &JobId { (**self).job_id() }
}

impl<T: JobScoped + ?Sized> JobScoped for Arc<T> {
    fn job_id(&self) -> &JobId { (**self).job_id() }
}

pub fn belongs_to_job(item: &impl JobScoped, scope: &JobScope) -> bool {
    scope.admits(item.job_id())
}
