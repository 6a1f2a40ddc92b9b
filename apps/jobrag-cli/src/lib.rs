use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use jobrag_core::config::{Config, Settings};
use jobrag_core::data_processor::DataProcessor;
use jobrag_core::store::MemoryChunkStore;
use jobrag_core::types::{ChunkDraft, JobId, JobStatus};
use jobrag_core::JobScope;
use jobrag_hybrid::{BatchAck, HybridEngine};

#[derive(Debug, Parser)]
#[command(name = "jobrag", version, about = "Job-scoped hybrid retrieval over local documents", rename_all = "kebab")]
pub struct Args {
	/// Chunk store file; overrides `data.store_path`.
	#[arg(long, global = true, value_name = "FILE")]
	pub store: Option<PathBuf>,
	#[command(subcommand)]
	pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
	/// Chunk every text file under DIR and index it under a job.
	Ingest {
		#[arg(long)]
		job: String,
		dir: PathBuf,
		/// Only process the first N files.
		#[arg(long)]
		limit: Option<usize>,
	},
	/// Retrieve ranked context for a question.
	Query {
		question: String,
		#[arg(long)]
		job: Option<String>,
		#[arg(long)]
		top_k: Option<usize>,
		#[arg(long)]
		document: Option<String>,
		#[arg(long)]
		no_rerank: bool,
		#[arg(long)]
		no_expand: bool,
	},
	/// Per-job document, chunk and index counts.
	Status,
	/// Rebuild both indexes from the chunk store.
	Reindex {
		#[arg(long)]
		job: Option<String>,
	},
	DeleteJob { job: String },
}

pub fn init_tracing(level: &str) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
	let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).try_init();
}

fn open_engine(settings: Settings, store: Option<PathBuf>) -> Result<HybridEngine> {
	let path = match store {
		Some(p) => p,
		None => settings.data.store_path(&std::env::current_dir()?),
	};
	let store = MemoryChunkStore::open(&path).with_context(|| format!("opening chunk store {}", path.display()))?;
	tracing::debug!(path = %path.display(), "Opened chunk store");
	Ok(HybridEngine::builder(settings).store(Arc::new(store)).build()?)
}

fn scope(job: Option<String>) -> Result<JobScope> {
	Ok(JobScope::from_option(job.as_deref().map(JobId::parse).transpose()?))
}

fn print(value: &impl serde::Serialize) -> Result<()> {
	println!("{}", serde_json::to_string_pretty(value)?);
	Ok(())
}

pub async fn run(args: Args) -> Result<()> {
	let config = Config::load().context("loading configuration")?;
	let settings = config.settings()?;
	init_tracing(&settings.log.level);
	let batch_size = settings.embed.batch_size.max(1);
	let engine = open_engine(settings, args.store)?;

	match args.command {
		Command::Ingest { job, dir, limit } => {
			let job = JobId::parse(&job)?;
			let processor = DataProcessor::new();
			let drafts = match limit {
				Some(n) => processor.process_directory_limited(&job, &dir, n)?,
				None => processor.process_directory(&job, &dir)?,
			};
			engine.start_job(&job);
			let ack = ingest(&engine, &job, drafts, batch_size).await?;
			print(&json!({ "job": job, "indexed": ack.indexed, "skipped": ack.skipped }))?;
		}
		Command::Query { question, job, top_k, document, no_rerank, no_expand } => {
			let mut options = engine.default_options();
			if let Some(k) = top_k { options.top_k = k; }
			options.document = document;
			options.rerank = !no_rerank;
			options.expand = !no_expand;
			let response = engine.query(&question, &scope(job)?, &options).await?;
			print(&response)?;
		}
		Command::Status => print(&engine.index_status())?,
		Command::Reindex { job } => print(&engine.reindex(&scope(job)?)?)?,
		Command::DeleteJob { job } => {
			let job = JobId::parse(&job)?;
			let removed = engine.delete_job(&job)?;
			print(&json!({ "job": job, "removed_chunks": removed }))?;
		}
	}
	Ok(())
}

async fn ingest(engine: &HybridEngine, job: &JobId, drafts: Vec<ChunkDraft>, batch_size: usize) -> Result<BatchAck> {
	let pb = ProgressBar::new(drafts.len() as u64);
	pb.set_style(
		ProgressStyle::default_bar()
			.template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({percent}%) {msg}")?
			.progress_chars("#>-"),
	);
	let mut total = BatchAck::default();
	for batch in drafts.chunks(batch_size) {
		match engine.index_batch(batch.to_vec()).await {
			Ok(ack) => {
				total.indexed += ack.indexed;
				total.skipped += ack.skipped;
				total.chunk_ids.extend(ack.chunk_ids);
			}
			Err(err) => {
				pb.abandon_with_message("indexing failed");
				engine.set_job_status(job, JobStatus::Failed)?;
				return Err(err.into());
			}
		}
		pb.inc(batch.len() as u64);
	}
	pb.finish_with_message(format!("{} new, {} already indexed", total.indexed, total.skipped));
	engine.set_job_status(job, JobStatus::Completed)?;
	Ok(total)
}
