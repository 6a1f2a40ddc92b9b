//! In-memory chunk store, optionally backed by an append-only JSON-lines file
//! with one chunk per line.
//!
//! Inserts are queued and `flush` appends only the queued chunks, so
//! persisting a batch costs the size of the batch. The first flush after a
//! removal rewrites the file from the live chunks.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, info};

use crate::error::Result;
use crate::isolation::{belongs_to_job, JobScope, JobScoped};
use crate::traits::ChunkStore;
use crate::types::{Chunk, ChunkId, JobId};

#[derive(Default)]
struct Inner {
    order: Vec<Arc<Chunk>>,
    by_id: HashMap<String, usize>,
}

impl Inner {
    fn insert(&mut self, chunk: Arc<Chunk>) -> bool {
        if self.by_id.contains_key(chunk.id()) { return false; }
        self.by_id.insert(chunk.id().to_string(), self.order.len());
        self.order.push(chunk);
        true
    }

    fn retain(&mut self, keep: impl Fn(&Chunk) -> bool) -> usize {
        let before = self.order.len();
        self.order.retain(|c| keep(c));
        self.by_id = self.order.iter().enumerate().map(|(i, c)| (c.id().to_string(), i)).collect();
        before - self.order.len()
    }
}

/// Writes not yet on disk.
#[derive(Default)]
struct Journal {
    pending: Vec<Arc<Chunk>>,
    compact: bool,
}

#[derive(Default)]
pub struct MemoryChunkStore {
    inner: RwLock<Inner>,
    path: Option<PathBuf>,
    journal: Mutex<Journal>,
}

impl MemoryChunkStore {
    pub fn new() -> Self { Self::default() }

    /// Open a file-backed store, loading existing chunks when the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut inner = Inner::default();
        let mut lines = 0;
        if path.exists() {
            for line in BufReader::new(fs::File::open(&path)?).lines() {
                let line = line?;
                if line.trim().is_empty() { continue; }
                lines += 1;
                inner.insert(Arc::new(serde_json::from_str::<Chunk>(&line)?));
            }
            info!(path = %path.display(), chunks = inner.order.len(), "Loaded chunk store");
        }
        // Repeated lines are dropped on load; compact them away on the next flush.
        let compact = lines > inner.order.len();
        Ok(Self { inner: RwLock::new(inner), path: Some(path), journal: Mutex::new(Journal { pending: Vec::new(), compact }) })
    }

    fn journal(&self) -> MutexGuard<'_, Journal> { self.journal.lock().unwrap_or_else(PoisonError::into_inner) }

    fn rewrite(&self, path: &Path) -> Result<usize> {
        let live: Vec<Arc<Chunk>> = self.inner.read().unwrap_or_else(PoisonError::into_inner).order.clone();
        let tmp = path.with_extension("jsonl.tmp");
        write_records(&tmp, false, &live)?;
        fs::rename(&tmp, path)?;
        Ok(live.len())
    }
}

fn write_records(path: &Path, append: bool, chunks: &[Arc<Chunk>]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() { fs::create_dir_all(parent)?; }
    }
    let file = OpenOptions::new().create(true).write(true).append(append).truncate(!append).open(path)?;
    let mut out = BufWriter::new(file);
    for chunk in chunks {
        serde_json::to_writer(&mut out, chunk.as_ref())?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

impl ChunkStore for MemoryChunkStore {
    fn insert(&self, chunk: Arc<Chunk>) -> Result<bool> {
        let inserted = self.inner.write().unwrap_or_else(PoisonError::into_inner).insert(Arc::clone(&chunk));
        if inserted && self.path.is_some() { self.journal().pending.push(chunk); }
        Ok(inserted)
    }

    fn get(&self, id: &str) -> Option<Arc<Chunk>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_id.get(id).map(|&pos| Arc::clone(&inner.order[pos]))
    }

    fn chunks(&self, scope: &JobScope) -> Vec<Arc<Chunk>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.order.iter().filter(|c| belongs_to_job(c, scope)).cloned().collect()
    }

    fn jobs(&self) -> Vec<JobId> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut jobs: Vec<JobId> = inner.order.iter().map(|c| c.job_id().clone()).collect();
        jobs.sort();
        jobs.dedup();
        jobs
    }

    fn remove(&self, ids: &[ChunkId]) -> Result<usize> {
        let removed = self.inner.write().unwrap_or_else(PoisonError::into_inner).retain(|c| !ids.iter().any(|id| id == c.id()));
        if removed > 0 {
            let mut journal = self.journal();
            journal.pending.retain(|c| !ids.iter().any(|id| id == c.id()));
            journal.compact = true;
        }
        Ok(removed)
    }

    fn remove_job(&self, job: &JobId) -> Result<usize> {
        let removed = self.inner.write().unwrap_or_else(PoisonError::into_inner).retain(|c| c.job_id() != job);
        if removed > 0 {
            let mut journal = self.journal();
            journal.pending.retain(|c| c.job_id() != job);
            journal.compact = true;
        }
        debug!(job = %job, removed, "Removed job from chunk store");
        Ok(removed)
    }

    fn len(&self) -> usize { self.inner.read().unwrap_or_else(PoisonError::into_inner).order.len() }

    fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let mut journal = self.journal();
        if journal.compact {
            let chunks = self.rewrite(path)?;
            journal.pending.clear();
            journal.compact = false;
            debug!(path = %path.display(), chunks, "Compacted chunk store");
        } else if !journal.pending.is_empty() {
            write_records(path, true, &journal.pending)?;
            debug!(path = %path.display(), appended = journal.pending.len(), "Flushed chunk store");
            journal.pending.clear();
        }
        Ok(())
    }
}
