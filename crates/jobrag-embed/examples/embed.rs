use jobrag_core::config::EmbedSettings;
use jobrag_embed::get_default_embedder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let embedder = get_default_embedder(&EmbedSettings::default())?;
    let texts = vec!["hello world".to_string(), "rust embeddings".to_string()];
    let embs = embedder.embed_batch(&texts).await?;
    println!("B={} dim={} id={}", embs.len(), embedder.dim(), embedder.id());
    Ok(())
}
