//! Domain types shared by the keyword index, the vector store and the hybrid engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::isolation::{JobScope, JobScoped};

pub type ChunkId = String;
pub type DocumentId = String;

const MAX_JOB_ID_LEN: usize = 128;

/// Identifier of a processing job, the isolation boundary for retrieval.
///
/// Trimmed, non-empty, at most 128 characters, and free of whitespace,
/// control characters and `/` (which separates the parts of a chunk id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::invalid_input("job id is empty"));
        }
        if trimmed.chars().count() > MAX_JOB_ID_LEN {
            return Err(Error::invalid_input(format!("job id longer than {MAX_JOB_ID_LEN} characters")));
        }
        if let Some(bad) = trimmed.chars().find(|c| c.is_whitespace() || c.is_control() || *c == '/') {
            return Err(Error::invalid_input(format!("job id '{trimmed}' contains invalid character {bad:?}")));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl FromStr for JobId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> { Self::parse(s) }
}

impl TryFrom<String> for JobId {
    type Error = Error;
    fn try_from(value: String) -> Result<Self> { Self::parse(&value) }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self { value.0 }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
}

/// What a chunk producer hands over, once per chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDraft {
    pub job_id: JobId,
    pub document_id: DocumentId,
    pub section_type: String,
    #[serde(default)]
    pub chunk_index: usize,
    pub text: String,
    #[serde(default)]
    pub priority: Priority,
}

impl ChunkDraft {
    pub fn new(job_id: JobId, document_id: impl Into<DocumentId>, section_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            job_id,
            document_id: document_id.into(),
            section_type: section_type.into(),
            chunk_index: 0,
            text: text.into(),
            priority: Priority::Normal,
        }
    }

    pub fn with_index(mut self, chunk_index: usize) -> Self { self.chunk_index = chunk_index; self }

    pub fn with_priority(mut self, priority: Priority) -> Self { self.priority = priority; self }

    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(Error::invalid_input(format!("chunk {} of document '{}' has no text", self.chunk_index, self.document_id)));
        }
        if self.document_id.trim().is_empty() {
            return Err(Error::invalid_input("document id is empty"));
        }
        if self.section_type.trim().is_empty() {
            return Err(Error::invalid_input(format!("document '{}' chunk {} has an empty section type", self.document_id, self.chunk_index)));
        }
        Ok(())
    }

    /// Deterministic id: the same draft always maps to the same chunk.
    pub fn chunk_id(&self) -> ChunkId {
        let digest = blake3::hash(self.text.as_bytes()).to_hex();
        format!(
            "{}/{}/{}/{}-{}",
            self.job_id,
            self.document_id,
            self.section_type,
            self.chunk_index,
            &digest.as_str()[..8]
        )
    }
}

/// The atomic retrieval unit. Built once from a [`ChunkDraft`] and never mutated.
///
/// - `tokens`: analyzer output for `text`, shared with the keyword index
/// - `embedding`: the provider's vector for `text`, if one was computed
/// - `ordinal`: process-wide insertion sequence used to break ranking ties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    id: ChunkId,
    job_id: JobId,
    document_id: DocumentId,
    section_type: String,
    chunk_index: usize,
    tokens: Vec<String>,
    text: String,
    embedding: Option<Vec<f32>>,
    priority: Priority,
    ordinal: u64,
    created_at: DateTime<Utc>,
}

impl Chunk {
    pub fn from_draft(draft: ChunkDraft, tokens: Vec<String>, embedding: Option<Vec<f32>>, ordinal: u64) -> Result<Self> {
        draft.validate()?;
        if let Some(vector) = &embedding {
            validate_vector(vector)?;
        }
        Ok(Self {
            id: draft.chunk_id(),
            job_id: draft.job_id,
            document_id: draft.document_id,
            section_type: draft.section_type,
            chunk_index: draft.chunk_index,
            tokens,
            text: draft.text,
            embedding,
            priority: draft.priority,
            ordinal,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn document_id(&self) -> &str { &self.document_id }
    pub fn section_type(&self) -> &str { &self.section_type }
    pub fn chunk_index(&self) -> usize { self.chunk_index }
    pub fn tokens(&self) -> &[String] { &self.tokens }
    pub fn text(&self) -> &str { &self.text }
    pub fn embedding(&self) -> Option<&[f32]> { self.embedding.as_deref() }
    pub fn priority(&self) -> Priority { self.priority }
    pub fn ordinal(&self) -> u64 { self.ordinal }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
}

impl JobScoped for Chunk {
    fn job_id(&self) -> &JobId { &self.job_id }
}

/// Rejects empty vectors and vectors holding NaN or infinities.
pub fn validate_vector(vector: &[f32]) -> Result<()> {
    if vector.is_empty() {
        return Err(Error::invalid_input("embedding is empty"));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(Error::invalid_input("embedding contains NaN or infinite values"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub job_id: JobId,
    pub chunk_ids: Vec<ChunkId>,
}

impl JobScoped for Document {
    fn job_id(&self) -> &JobId { &self.job_id }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, status: JobStatus) -> Self {
        let now = Utc::now();
        Self { id, status, created_at: now, updated_at: now }
    }
}

impl JobScoped for Job {
    fn job_id(&self) -> &JobId { &self.id }
}

/// Indicates which retrieval method produced a ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMethod {
    Keyword,
    Vector,
}

impl fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keyword => f.write_str("keyword"),
            Self::Vector => f.write_str("vector"),
        }
    }
}

/// A preprocessed question, ready to be dispatched to every backend.
///
/// `keywords` feed the keyword index, `alternates` are extra keyword
/// phrasings from query expansion, `embedding` feeds the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub scope: JobScope,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub alternates: Vec<Vec<String>>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub document: Option<DocumentId>,
}

impl Query {
    pub fn new(text: impl Into<String>, scope: JobScope) -> Self {
        Self { text: text.into(), scope, keywords: Vec::new(), alternates: Vec::new(), embedding: None, document: None }
    }
}

/// One entry of a single backend's ranking. Higher `score` is better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedResult {
    pub chunk_id: ChunkId,
    pub score: f64,
    pub method: RetrievalMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankContribution {
    pub method: RetrievalMethod,
    /// 1-based position in that method's list.
    pub rank: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
    pub chunk_id: ChunkId,
    pub score: f64,
    pub contributions: Vec<RankContribution>,
}

impl FusedResult {
    pub fn best_rank(&self) -> Option<usize> {
        self.contributions.iter().map(|c| c.rank).min()
    }

    pub fn rank_for(&self, method: RetrievalMethod) -> Option<usize> {
        self.contributions.iter().find(|c| c.method == method).map(|c| c.rank)
    }
}

/// A document reachable from another one in the relationship graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedDocument {
    pub document_id: DocumentId,
    pub job_id: JobId,
    pub relation: String,
}

impl JobScoped for RelatedDocument {
    fn job_id(&self) -> &JobId { &self.job_id }
}
