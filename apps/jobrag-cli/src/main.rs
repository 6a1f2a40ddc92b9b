use clap::Parser;

use jobrag_cli::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    jobrag_cli::run(args).await
}
