use std::env;
use std::path::PathBuf;

use jobrag_core::config::Settings;
use jobrag_core::data_processor::DataProcessor;
use jobrag_core::types::JobId;
use jobrag_core::JobScope;
use jobrag_hybrid::HybridEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args: Vec<String> = env::args().collect();
	if args.len() < 3 {
		eprintln!("Usage: {} <data_dir> <question> [job]", args[0]);
		std::process::exit(1);
	}
	let data_dir = PathBuf::from(&args[1]);
	let job = JobId::parse(args.get(3).map_or("demo", String::as_str))?;

	let engine = HybridEngine::new(Settings::default())?;
	let drafts = DataProcessor::new().process_directory(&job, &data_dir)?;
	let ack = engine.index_batch(drafts).await?;
	println!("indexed {} chunks under job {job}", ack.indexed);

	let response = engine.query(&args[2], &JobScope::Job(job), &engine.default_options()).await?;
	for passage in response.ranked_context.passages() {
		println!("\n  {}. score={:.4}  {} | {}", passage.rank, passage.score, passage.document_id, passage.section_type);
		println!("     {}", passage.text);
	}
	println!("\nconfidence: {:?}", response.confidence.level);
	Ok(())
}
