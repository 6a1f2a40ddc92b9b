use std::fs;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

use jobrag_core::config::{Config, RerankProvider, Settings};
use jobrag_core::data_processor::{ChunkingConfig, DataProcessor};
use jobrag_core::store::MemoryChunkStore;
use jobrag_core::traits::ChunkStore;
use jobrag_core::types::{Chunk, ChunkDraft, JobId, Priority};
use jobrag_core::{belongs_to_job, Error, JobScope};

fn job(id: &str) -> JobId { JobId::parse(id).unwrap() }

fn chunk(job_id: &str, doc: &str, text: &str, ordinal: u64) -> Arc<Chunk> {
    let draft = ChunkDraft::new(job(job_id), doc, "body", text);
    Arc::new(Chunk::from_draft(draft, vec![], None, ordinal).unwrap())
}

#[test]
fn process_directory_single_small_file() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    let file_path = dir.join("a.txt");
    let mut f = fs::File::create(&file_path).unwrap();
    writeln!(f, "Short text").unwrap();

    let processor = DataProcessor::new();
    let chunks = processor.process_directory(&job("j1"), dir).expect("process");

    assert_eq!(chunks.len(), 1, "one small paragraph becomes one chunk");
    assert_eq!(chunks[0].text.trim(), "Short text");
    assert_eq!(chunks[0].document_id, "a");
    assert_eq!(chunks[0].job_id, job("j1"));
}

#[test]
fn process_directory_limited_two_files_limit_one() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::write(dir.join("a.txt"), "alpha bravo").unwrap();
    fs::write(dir.join("b.txt"), "charlie delta").unwrap();

    let processor = DataProcessor::new();
    let chunks = processor.process_directory_limited(&job("j1"), dir, 1).expect("process limited");

    let mut doc_ids = std::collections::HashSet::new();
    for c in &chunks { doc_ids.insert(c.document_id.clone()); }
    assert_eq!(doc_ids.len(), 1, "limited to one source document");
}

#[test]
fn headings_set_section_and_priority() {
    let text = "# Abstract\nWe propose a retrieval method.\n\n# Related Work\nPrior systems exist.";
    let drafts = DataProcessor::new().process_text(&job("j1"), "paper", text);
    assert_eq!(drafts.len(), 2);
    assert_eq!(drafts[0].section_type, "abstract");
    assert_eq!(drafts[0].priority, Priority::High);
    assert_eq!(drafts[1].section_type, "related-work");
    assert_eq!(drafts[1].priority, Priority::Normal);
    assert_eq!(drafts[1].chunk_index, 1);
}

#[test]
fn long_paragraphs_split_into_overlapping_windows() {
    let words: Vec<String> = (0..25).map(|i| format!("w{i}")).collect();
    let processor = DataProcessor::with_config(ChunkingConfig { words_per_chunk: 10, overlap_percent: 0.2 });
    let drafts = processor.process_text(&job("j1"), "doc", &words.join(" "));
    assert_eq!(drafts.len(), 3);
    assert!(drafts[0].text.ends_with("w9"));
    assert!(drafts[1].text.starts_with("w8"), "two words of overlap");
    assert!(drafts[2].text.ends_with("w24"));
}

#[test]
fn job_id_validation() {
    assert!(matches!(JobId::parse("  "), Err(Error::InvalidInput(_))));
    assert!(matches!(JobId::parse("a b"), Err(Error::InvalidInput(_))));
    assert!(matches!(JobId::parse("a/b"), Err(Error::InvalidInput(_))));
    assert!(JobId::parse(&"x".repeat(129)).is_err());
    assert_eq!(JobId::parse(" job-42 ").unwrap().as_str(), "job-42");
}

#[test]
fn chunk_ids_are_deterministic() {
    let a = ChunkDraft::new(job("j1"), "doc", "body", "same text").with_index(2);
    let b = ChunkDraft::new(job("j1"), "doc", "body", "same text").with_index(2);
    let c = ChunkDraft::new(job("j1"), "doc", "body", "other text").with_index(2);
    assert_eq!(a.chunk_id(), b.chunk_id());
    assert_ne!(a.chunk_id(), c.chunk_id());
    assert!(a.chunk_id().starts_with("j1/doc/body/2-"));
}

#[test]
fn chunk_rejects_bad_drafts_and_vectors() {
    let empty = ChunkDraft::new(job("j1"), "doc", "body", "   ");
    assert!(matches!(Chunk::from_draft(empty, vec![], None, 0), Err(Error::InvalidInput(_))));
    let draft = ChunkDraft::new(job("j1"), "doc", "body", "text");
    assert!(Chunk::from_draft(draft.clone(), vec![], Some(vec![f32::NAN]), 0).is_err());
    assert!(Chunk::from_draft(draft, vec![], Some(vec![]), 0).is_err());
}

#[test]
fn guard_admits_only_matching_job() {
    let c = chunk("a", "doc", "text", 0);
    assert!(belongs_to_job(&c, &JobScope::Job(job("a"))));
    assert!(!belongs_to_job(&c, &JobScope::Job(job("b"))));
    assert!(belongs_to_job(&c, &JobScope::All));
}

#[test]
fn store_insert_scope_and_remove() {
    let store = MemoryChunkStore::new();
    assert!(store.insert(chunk("a", "d1", "one", 0)).unwrap());
    assert!(!store.insert(chunk("a", "d1", "one", 5)).unwrap(), "same id is not inserted twice");
    store.insert(chunk("b", "d2", "two", 1)).unwrap();
    store.insert(chunk("a", "d3", "three", 2)).unwrap();

    let a: Vec<String> = store.chunks(&JobScope::Job(job("a"))).iter().map(|c| c.text().to_string()).collect();
    assert_eq!(a, vec!["one", "three"]);
    assert_eq!(store.jobs(), vec![job("a"), job("b")]);
    assert_eq!(store.remove_job(&job("a")).unwrap(), 2);
    assert_eq!(store.len(), 1);
    assert!(store.get(chunk("b", "d2", "two", 1).id()).is_some());
}

#[test]
fn store_round_trips_through_jsonl_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("nested/chunks.jsonl");
    let store = MemoryChunkStore::open(&path).unwrap();
    store.insert(chunk("a", "d1", "one", 3)).unwrap();
    store.insert(chunk("a", "d2", "two", 7)).unwrap();
    store.flush().unwrap();

    let reopened = MemoryChunkStore::open(&path).unwrap();
    assert_eq!(reopened.len(), 2);
    let ordinals: Vec<u64> = reopened.chunks(&JobScope::All).iter().map(|c| c.ordinal()).collect();
    assert_eq!(ordinals, vec![3, 7]);
    assert_eq!(reopened.chunks(&JobScope::All)[0].text(), "one");
}

#[test]
fn flush_appends_only_new_chunks_and_compacts_after_removal() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("chunks.jsonl");
    let lines = || fs::read_to_string(&path).unwrap().lines().count();
    let store = MemoryChunkStore::open(&path).unwrap();

    store.insert(chunk("a", "d1", "one", 0)).unwrap();
    store.flush().unwrap();
    store.flush().unwrap();
    assert_eq!(lines(), 1);
    store.insert(chunk("b", "d2", "two", 1)).unwrap();
    store.insert(chunk("a", "d3", "three", 2)).unwrap();
    store.flush().unwrap();
    assert_eq!(lines(), 3);

    assert_eq!(store.remove(&[chunk("a", "d3", "three", 2).id().to_string()]).unwrap(), 1);
    assert_eq!(store.remove_job(&job("b")).unwrap(), 1);
    store.flush().unwrap();
    assert_eq!(lines(), 1);
    let reopened = MemoryChunkStore::open(&path).unwrap();
    assert_eq!(reopened.jobs(), vec![job("a")]);
    assert_eq!(reopened.chunks(&JobScope::All)[0].text(), "one");
}

#[test]
fn documents_group_chunks_per_job() {
    let store = MemoryChunkStore::new();
    store.insert(chunk("a", "d1", "one", 0)).unwrap();
    store.insert(chunk("b", "d1", "other job", 1)).unwrap();
    store.insert(chunk("a", "d2", "two", 2)).unwrap();
    store.insert(chunk("a", "d1", "three", 3)).unwrap();

    let docs = store.documents(&JobScope::Job(job("a")));
    let shape: Vec<(&str, usize)> = docs.iter().map(|d| (d.id.as_str(), d.chunk_ids.len())).collect();
    assert_eq!(shape, vec![("d1", 2), ("d2", 1)]);
    assert!(docs.iter().all(|d| belongs_to_job(d, &JobScope::Job(job("a")))));
    assert_eq!(store.documents(&JobScope::All).len(), 3);
}

#[test]
fn config_merges_toml_and_env() {
    figment::Jail::expect_with(|jail| {
        jail.create_file("config.toml", r#"
            [rerank]
            top_n = 8
            [aggregate]
            dedup_threshold = 0.9
        "#)?;
        jail.set_env("RUST_ENV", "test");
        jail.set_env("APP_RERANK__TIMEOUT_MS", "750");
        let settings = Config::load().unwrap().settings().unwrap();
        assert_eq!(settings.rerank.top_n, 8);
        assert_eq!(settings.rerank.timeout_ms, 750);
        assert_eq!(settings.rerank.provider, RerankProvider::Heuristic);
        assert_eq!(settings.aggregate.dedup_threshold, 0.9);
        assert_eq!(settings.vector.similarity_threshold, 0.25);
        Ok(())
    });
}

#[test]
fn config_rejects_out_of_range_values() {
    figment::Jail::expect_with(|jail| {
        jail.create_file("config.toml", "[keyword]\nb = 1.5\n")?;
        assert!(matches!(Config::load(), Err(Error::InvalidConfig(_))));
        Ok(())
    });
    let mut settings = Settings::default();
    settings.retrieval.candidate_limit = 0;
    assert!(settings.validate().is_err());
    assert!(Settings::default().validate().is_ok());
}
