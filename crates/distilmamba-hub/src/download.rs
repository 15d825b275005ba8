use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use hf_hub::{
    api::tokio::{Api, ApiBuilder, ApiRepo},
    Repo, RepoType,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::{
    cache::{FileMetadata, ModelCache},
    error::{HubError, HubResult},
    integrity::sha256_file,
};

/// Files a pulled model directory must contain before training can start.
/// Weight files are resolved separately.
pub const REQUIRED_MODEL_FILES: &[&str] = &["config.json", "tokenizer.json"];

/// Tokenizer side files that improve pad/eos resolution when present.
const OPTIONAL_MODEL_FILES: &[&str] = &["tokenizer_config.json", "special_tokens_map.json"];

const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
const SAFETENSORS_SINGLE: &str = "model.safetensors";

const PB_TEMPLATE_SIZED: &str = "{wide_msg}\n[{bar:50.cyan/blue}] {bytes}/{total_bytes}  {bytes_per_sec}  ETA {eta}";
const PB_TEMPLATE_SPINNER: &str = "{spinner:.green} {wide_msg}  {bytes}  {bytes_per_sec}  [{elapsed_precise}]";

/// Pulls safetensors model repositories into a [`ModelCache`].
pub struct ModelDownloader {
    cache: ModelCache,
    api: Api,
    http: reqwest::Client,
    hf_token: Option<String>,
}

impl ModelDownloader {
    /// Reads `HUGGING_FACE_HUB_TOKEN` from the environment if present.
    pub fn new(cache: ModelCache) -> HubResult<Self> {
        let hf_token = std::env::var("HUGGING_FACE_HUB_TOKEN").ok().filter(|t| !t.is_empty());

        let api = ApiBuilder::new()
            .with_token(hf_token.clone())
            .build()
            .map_err(|e| HubError::DownloadFailed { file: "<api init>".into(), reason: e.to_string() })?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("distilmamba/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HubError::DownloadFailed { file: "<http client>".into(), reason: e.to_string() })?;

        Ok(Self { cache, api, http, hf_token })
    }

    /// Download config, tokenizer and safetensors weights of `repo_id`.
    ///
    /// Missing optional tokenizer side files are logged and skipped; any
    /// other failure aborts the pull.
    pub async fn pull(&self, repo_id: &str, revision: &str, mp: Option<&MultiProgress>) -> HubResult<Vec<PathBuf>> {
        info!(repo_id, revision, "Pulling model");

        let repo = self
            .api
            .repo(Repo::with_revision(repo_id.to_string(), RepoType::Model, revision.to_string()));

        let mut required: Vec<String> = REQUIRED_MODEL_FILES.iter().map(|s| s.to_string()).collect();
        match repo.get(SAFETENSORS_INDEX).await {
            Ok(index_path) => {
                required.extend(shard_filenames(&index_path)?);
                required.push(SAFETENSORS_INDEX.to_string());
            }
            Err(e) => {
                debug!(error = %e, "No sharded index; expecting a single weights file");
                required.push(SAFETENSORS_SINGLE.to_string());
            }
        }

        let mut paths = Vec::with_capacity(required.len() + OPTIONAL_MODEL_FILES.len());
        for filename in &required {
            paths.push(self.download_file(&repo, repo_id, revision, filename, mp).await?);
        }
        for filename in OPTIONAL_MODEL_FILES {
            match self.download_file(&repo, repo_id, revision, filename, mp).await {
                Ok(p) => paths.push(p),
                Err(e) => warn!(filename, error = %e, "Optional file not available, skipping"),
            }
        }

        info!(repo_id, files = paths.len(), "Model ready");
        Ok(paths)
    }

    /// Stream one file to `<dest>.tmp`, rename on success and record its
    /// SHA-256 sidecar. Already-cached files are returned as-is.
    async fn download_file(
        &self,
        repo: &ApiRepo,
        repo_id: &str,
        revision: &str,
        filename: &str,
        mp: Option<&MultiProgress>,
    ) -> HubResult<PathBuf> {
        let dest = self.cache.file_path(repo_id, revision, filename);
        if self.cache.is_cached(repo_id, revision, filename) {
            debug!(filename, "Already cached, skipping download");
            return Ok(dest);
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = repo.url(filename);
        info!(filename, "Downloading");

        let mut req = self.http.get(&url);
        if let Some(ref token) = self.hf_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        let response = req.send().await.map_err(|e| HubError::DownloadFailed {
            file: filename.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let hint = if status.as_u16() == 401 || status.as_u16() == 403 {
                " (hint: set HUGGING_FACE_HUB_TOKEN for gated repos)"
            } else {
                ""
            };
            return Err(HubError::DownloadFailed { file: filename.to_string(), reason: format!("HTTP {status}{hint}") });
        }

        let pb = mp.map(|m| new_progress_bar(m, response.content_length(), filename));

        let tmp_path = dest.with_file_name(format!("{filename}.tmp"));
        if let Err(e) = stream_to_disk(response, &tmp_path, pb.as_ref()).await {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
        std::fs::rename(&tmp_path, &dest)?;

        let size_bytes = std::fs::metadata(&dest)?.len();
        self.cache.write_meta(&FileMetadata {
            repo_id: repo_id.to_string(),
            revision: revision.to_string(),
            filename: filename.to_string(),
            sha256: sha256_file(&dest)?,
            size_bytes,
        })?;

        if let Some(pb) = pb {
            pb.finish_with_message(format!("Done  {filename}"));
        }
        Ok(dest)
    }
}

fn new_progress_bar(mp: &MultiProgress, total: Option<u64>, filename: &str) -> ProgressBar {
    let pb = match total {
        Some(total) => {
            let pb = mp.add(ProgressBar::new(total));
            pb.set_style(
                ProgressStyle::with_template(PB_TEMPLATE_SIZED)
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("##-"),
            );
            pb
        }
        None => {
            let pb = mp.add(ProgressBar::new_spinner());
            pb.set_style(ProgressStyle::with_template(PB_TEMPLATE_SPINNER).unwrap_or_else(|_| ProgressStyle::default_spinner()));
            pb.enable_steady_tick(std::time::Duration::from_millis(100));
            pb
        }
    };
    pb.set_message(filename.to_string());
    pb
}

async fn stream_to_disk(response: reqwest::Response, path: &Path, pb: Option<&ProgressBar>) -> HubResult<()> {
    use std::io::Write;

    let mut file = std::fs::File::create(path)?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| HubError::DownloadFailed {
            file: path.to_string_lossy().to_string(),
            reason: e.to_string(),
        })?;
        file.write_all(&chunk)?;
        if let Some(pb) = pb {
            pb.inc(chunk.len() as u64);
        }
    }
    file.flush()?;
    Ok(())
}

/// Unique, sorted shard file names referenced by a safetensors index.
fn shard_filenames(index_path: &Path) -> HubResult<Vec<String>> {
    let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(index_path)?)?;
    let shards: BTreeSet<String> = index["weight_map"]
        .as_object()
        .map(|m| m.values().filter_map(|v| v.as_str()).map(String::from).collect())
        .unwrap_or_default();
    Ok(shards.into_iter().collect())
}
