use indicatif::MultiProgress;
use tracing::info;

use distilmamba_hub::{ModelCache, ModelDownloader};

use crate::config::AppConfig;

/// Download the configured base model into the local cache.
pub async fn run(config: &AppConfig) -> anyhow::Result<()> {
    let (repo_id, revision) = (config.model.id.as_str(), config.model.revision.as_str());
    let cache_dir = config.cache_dir();

    info!(repo_id, revision, cache_dir = %cache_dir.display(), "Pulling model");

    let cache = ModelCache::new(&cache_dir)?;
    let downloader = ModelDownloader::new(cache)?;
    let mp = MultiProgress::new();
    let paths = downloader.pull(repo_id, revision, Some(&mp)).await?;

    println!("\nModel '{}' cached to {}", repo_id, cache_dir.display());
    println!("{} file(s):", paths.len());
    for p in &paths {
        println!("  {}", p.display());
    }

    Ok(())
}
