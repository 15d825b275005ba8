pub mod distill;
pub mod evaluate;
pub mod predict;
pub mod pull;
pub mod run;
pub mod train_teacher;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use indicatif::MultiProgress;
use tracing::{info, warn};

use distilmamba_core::device::device_name;
use distilmamba_core::{select_device, weights, MambaConfig, Tokenizer};
use distilmamba_hub::{evict_corrupt, ModelCache, ModelDownloader, REQUIRED_MODEL_FILES};
use distilmamba_train::dataset::{load_split, take_percent};
use distilmamba_train::{DataLoader, EncodedDataset, EvalReport, FreezePolicy, PoolingMode, SequenceClassifier, Split};
use distilmamba_train::NUM_LABELS;

use crate::config::AppConfig;

const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";

/// Everything a training command needs before the first step.
pub(crate) struct Session {
    pub device: Device,
    pub model_dir: PathBuf,
    pub teacher_config: MambaConfig,
    pub pooling: PoolingMode,
    pub train: DataLoader,
    pub eval: DataLoader,
}

impl Session {
    /// Make sure the base model is cached, then load its config and both
    /// tokenised dataset splits.
    pub async fn prepare(cfg: &AppConfig) -> Result<Self> {
        let model_dir = ensure_cached(cfg).await?;
        let device = select_device(cfg.device.prefer_gpu, cfg.device.cuda_device_id)?;
        info!(device = device_name(&device), "Compute device selected");

        let tokenizer = Tokenizer::from_dir(&model_dir)
            .with_context(|| format!("Failed to load tokenizer from {}", model_dir.display()))?;
        let teacher_config = MambaConfig::from_file(&model_dir.join("config.json"))
            .with_context(|| format!("Failed to read {}/config.json", model_dir.display()))?;

        check_vocab(&tokenizer, &teacher_config)?;

        let (train, eval) = load_loaders(cfg, &tokenizer, cfg.data.max_length, &device)?;
        Ok(Self { device, model_dir, teacher_config, pooling: cfg.model.pooling, train, eval })
    }

    /// Teacher classifier initialised with the pretrained base weights.
    pub fn pretrained_teacher(&self) -> Result<SequenceClassifier> {
        let teacher = self.classifier(&self.teacher_config)?;
        let loaded = teacher.load_pretrained(&self.model_dir)?;
        info!(tensors = loaded, "Teacher base initialised from pretrained weights");
        Ok(teacher)
    }

    /// Freshly initialised classifier with the session's pooling.
    pub fn classifier(&self, config: &MambaConfig) -> Result<SequenceClassifier> {
        SequenceClassifier::mamba(config, NUM_LABELS, self.pooling, FreezePolicy::default(), &self.device)
    }
}

/// Every token id must index a row of the model's embedding table.
pub(crate) fn check_vocab(tokenizer: &Tokenizer, config: &MambaConfig) -> Result<()> {
    anyhow::ensure!(
        tokenizer.vocab_size() <= config.vocab_size,
        "tokenizer has {} tokens but the model embeds only {}",
        tokenizer.vocab_size(),
        config.vocab_size
    );
    Ok(())
}

/// Download the base model unless every required file is already cached
/// and matches its recorded digest. Returns the model directory.
pub(crate) async fn ensure_cached(cfg: &AppConfig) -> Result<PathBuf> {
    let (repo_id, revision) = (cfg.model.id.as_str(), cfg.model.revision.as_str());
    let cache = ModelCache::new(cfg.cache_dir())?;

    if let Some(model_dir) = verified_model_dir(&cache, repo_id, revision)? {
        info!(model_id = repo_id, "Model already cached, skipping download");
        return Ok(model_dir);
    }

    println!("Model '{repo_id}' not found in cache, downloading from Hugging Face …");
    let model_dir = cache.model_dir(repo_id, revision);
    let downloader = ModelDownloader::new(cache).context("Failed to create model downloader")?;
    let mp = MultiProgress::new();
    let paths = downloader
        .pull(repo_id, revision, Some(&mp))
        .await
        .with_context(|| format!("Download failed for '{repo_id}'"))?;
    info!(model_id = repo_id, files = paths.len(), "Model downloaded and cached");
    Ok(model_dir)
}

/// The cached model directory if config, tokenizer and every weights file
/// are present and intact. Corrupt files are evicted so the next pull
/// replaces them.
fn verified_model_dir(cache: &ModelCache, repo_id: &str, revision: &str) -> Result<Option<PathBuf>> {
    let model_dir = cache.model_dir(repo_id, revision);
    if !cache.missing_files(repo_id, revision, REQUIRED_MODEL_FILES).is_empty() {
        return Ok(None);
    }
    let Ok(weight_paths) = weights::collect_safetensor_paths(&model_dir) else {
        return Ok(None);
    };

    let mut files: Vec<String> = REQUIRED_MODEL_FILES.iter().map(|f| f.to_string()).collect();
    files.extend(
        weight_paths
            .iter()
            .filter_map(|p| p.file_name())
            .map(|name| name.to_string_lossy().into_owned()),
    );
    if model_dir.join(SAFETENSORS_INDEX).exists() {
        files.push(SAFETENSORS_INDEX.to_string());
    }
    let evicted = evict_corrupt(cache, repo_id, revision, &files)
        .with_context(|| format!("Cannot verify cached files in {}", model_dir.display()))?;
    if !evicted.is_empty() {
        warn!(model_id = repo_id, files = ?evicted, "Cached model files are corrupt and will be downloaded again");
        return Ok(None);
    }
    Ok(Some(model_dir))
}

/// Train (shuffled) and test (fixed order) loaders over the configured subset.
pub(crate) fn load_loaders(
    cfg: &AppConfig,
    tokenizer: &Tokenizer,
    max_length: usize,
    device: &Device,
) -> Result<(DataLoader, DataLoader)> {
    let data_dir = cfg.data_dir();
    let encode = |split: Split| -> Result<EncodedDataset> {
        let rows = load_split(&data_dir, split)?;
        let total = rows.len();
        let rows = take_percent(rows, cfg.data.subset_percent);
        info!(split = split.file_name(), total, used = rows.len(), "Dataset split loaded");
        EncodedDataset::encode(&rows, tokenizer, max_length)
    };

    let train = DataLoader::new(encode(Split::Train)?, cfg.data.batch_size, Some(cfg.data.shuffle_seed), device)
        .context("Cannot build training loader")?;
    let eval = DataLoader::new(encode(Split::Test)?, cfg.data.batch_size, None, device)
        .context("Cannot build evaluation loader")?;
    Ok((train, eval))
}

/// Human-readable report in the style of the final run summary.
pub(crate) fn print_report(title: &str, report: &EvalReport) {
    println!("\n{title}");
    println!("  accuracy: {:.4} ({}/{})", report.accuracy, report.correct, report.total);
    println!("  prediction distribution:");
    for (i, (count, pct)) in report.distribution.counts().iter().zip(report.distribution.percentages()).enumerate() {
        let name = distilmamba_train::Emotion::from_index(i).map_or("?", |e| e.name());
        println!("    {name:<9} {count:>5}  ({pct:5.1}%)");
    }
}

pub(crate) fn require_dir(dir: &Path) -> Result<()> {
    anyhow::ensure!(dir.is_dir(), "output directory {} does not exist (run `distilmamba run` first)", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use distilmamba_hub::integrity::sha256_file;
    use distilmamba_hub::FileMetadata;

    const REPO: &str = "state-spaces/mamba-130m-hf";

    fn cache_file(cache: &ModelCache, filename: &str, contents: &[u8]) {
        let path = cache.file_path(REPO, "main", filename);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        cache
            .write_meta(&FileMetadata {
                repo_id: REPO.into(),
                revision: "main".into(),
                filename: filename.into(),
                sha256: sha256_file(&path).unwrap(),
                size_bytes: contents.len() as u64,
            })
            .unwrap();
    }

    fn complete_cache(dir: &Path) -> ModelCache {
        let cache = ModelCache::new(dir).unwrap();
        cache_file(&cache, "config.json", b"{}");
        cache_file(&cache, "tokenizer.json", b"{}");
        cache_file(&cache, "model.safetensors", &[1u8; 2048]);
        cache
    }

    #[test]
    fn intact_cache_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = complete_cache(dir.path());
        let model_dir = verified_model_dir(&cache, REPO, "main").unwrap();
        assert_eq!(model_dir, Some(cache.model_dir(REPO, "main")));
    }

    #[test]
    fn truncated_weights_force_a_fresh_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = complete_cache(dir.path());
        let weights = cache.file_path(REPO, "main", "model.safetensors");
        std::fs::write(&weights, [1u8; 64]).unwrap();

        assert_eq!(verified_model_dir(&cache, REPO, "main").unwrap(), None);
        assert!(!weights.exists(), "corrupt weights must be evicted");
        assert!(cache.is_cached(REPO, "main", "config.json"));
    }

    #[test]
    fn missing_weights_or_tokenizer_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::new(dir.path()).unwrap();
        cache_file(&cache, "config.json", b"{}");
        cache_file(&cache, "tokenizer.json", b"{}");
        assert_eq!(verified_model_dir(&cache, REPO, "main").unwrap(), None);

        cache_file(&cache, "model.safetensors", b"w");
        cache.evict(REPO, "main", "tokenizer.json").unwrap();
        assert_eq!(verified_model_dir(&cache, REPO, "main").unwrap(), None);
    }
}
