//! Plain-text chunk producer.
//!
//! Turns `.txt` files into [`ChunkDraft`]s tagged with a job id. Lines starting
//! with `#` open a new section; paragraphs longer than the window are split
//! into overlapping word windows.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Result;
use crate::types::{ChunkDraft, JobId, Priority};

const DEFAULT_SECTION: &str = "body";

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    pub words_per_chunk: usize,
    pub overlap_percent: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { words_per_chunk: 300, overlap_percent: 0.2 }
    }
}

#[derive(Default)]
pub struct DataProcessor {
    chunking_config: ChunkingConfig,
}

impl DataProcessor {
    pub fn new() -> Self { Self::default() }

    pub fn with_config(chunking_config: ChunkingConfig) -> Self { Self { chunking_config } }

    pub fn process_directory(&self, job: &JobId, data_dir: &Path) -> Result<Vec<ChunkDraft>> {
        self.process_files(job, self.list_txt_files(data_dir))
    }

    pub fn process_directory_limited(&self, job: &JobId, data_dir: &Path, limit: usize) -> Result<Vec<ChunkDraft>> {
        let mut files = self.list_txt_files(data_dir);
        if files.len() > limit { files.truncate(limit); debug!(limit, "Limited input files"); }
        self.process_files(job, files)
    }

    fn process_files(&self, job: &JobId, files: Vec<PathBuf>) -> Result<Vec<ChunkDraft>> {
        if files.is_empty() {
            info!(job = %job, "No .txt files found");
            return Ok(vec![]);
        }
        let mut all_chunks = Vec::new();
        for (file_index, file_path) in files.iter().enumerate() {
            debug!(file = %file_path.display(), n = file_index + 1, of = files.len(), "Processing file");
            let content = self.read_file_content(file_path)?;
            let doc_id = self.extract_doc_id(file_path);
            all_chunks.extend(self.process_text(job, &doc_id, &content));
        }
        info!(job = %job, files = files.len(), chunks = all_chunks.len(), "Processed files");
        Ok(all_chunks)
    }

    /// Chunk one document's text. Chunk indexes run across sections.
    pub fn process_text(&self, job: &JobId, document_id: &str, content: &str) -> Vec<ChunkDraft> {
        let mut drafts = Vec::new();
        let mut section = DEFAULT_SECTION.to_string();
        let mut chunk_index = 0;
        for paragraph in content.split("\n\n") {
            let mut body = Vec::new();
            for line in paragraph.lines() {
                match line.trim_start().strip_prefix('#') {
                    Some(heading) => section = normalize_section(heading),
                    None => body.push(line),
                }
            }
            let paragraph = body.join("\n");
            let paragraph = paragraph.trim();
            if paragraph.is_empty() { continue; }
            let priority = section_priority(&section);
            for text in self.split_paragraph_with_overlap(paragraph) {
                drafts.push(
                    ChunkDraft::new(job.clone(), document_id, section.clone(), text)
                        .with_index(chunk_index)
                        .with_priority(priority),
                );
                chunk_index += 1;
            }
        }
        drafts
    }

    fn read_file_content(&self, file_path: &Path) -> Result<String> {
        match fs::read_to_string(file_path) {
            Ok(content) => Ok(content),
            Err(_) => Ok(String::from_utf8_lossy(&fs::read(file_path)?).to_string()),
        }
    }

    fn extract_doc_id(&self, file_path: &Path) -> String {
        file_path.file_stem().map_or_else(|| "document".to_string(), |s| s.to_string_lossy().to_string())
    }

    fn split_paragraph_with_overlap(&self, paragraph: &str) -> Vec<String> {
        let words: Vec<&str> = paragraph.split_whitespace().collect();
        let words_per_chunk = self.chunking_config.words_per_chunk.max(1);
        if words.len() <= words_per_chunk { return vec![words.join(" ")]; }
        let overlap_words = ((words_per_chunk as f32 * self.chunking_config.overlap_percent) as usize).min(words_per_chunk - 1);
        let mut chunks = Vec::new(); let mut start = 0;
        while start < words.len() {
            let end = (start + words_per_chunk).min(words.len());
            chunks.push(words[start..end].join(" "));
            if end >= words.len() { break; }
            start = end - overlap_words;
        }
        chunks
    }

    fn list_txt_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut txt_files = Vec::new();
        for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()).filter(|e| e.file_type().is_file()) {
            let path = entry.path(); if path.extension().and_then(|s| s.to_str()) == Some("txt") { txt_files.push(path.to_path_buf()); }
        }
        txt_files.sort(); txt_files
    }
}

fn normalize_section(heading: &str) -> String {
    let words: Vec<String> = heading
        .trim_start_matches('#')
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    if words.is_empty() { DEFAULT_SECTION.to_string() } else { words.join("-") }
}

fn section_priority(section: &str) -> Priority {
    if section.contains("abstract") || section.contains("contribution") { Priority::High } else { Priority::Normal }
}
