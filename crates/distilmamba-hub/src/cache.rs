use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::HubResult;

/// Sidecar metadata written next to every downloaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub repo_id: String,
    pub revision: String,
    pub filename: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// On-disk model cache.
///
/// Layout: `<root>/<owner>__<name>/<revision>/<filename>` with a
/// `<filename>.meta.json` sidecar per file.
#[derive(Debug, Clone)]
pub struct ModelCache {
    root: PathBuf,
}

impl ModelCache {
    /// Open (and create) a cache rooted at `root`. A leading `~` is expanded.
    pub fn new(root: impl Into<PathBuf>) -> HubResult<Self> {
        let root = expand_tilde(&root.into());
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory holding every file of `(repo_id, revision)`.
    pub fn model_dir(&self, repo_id: &str, revision: &str) -> PathBuf {
        self.root.join(repo_id.replace('/', "__")).join(revision)
    }

    pub fn file_path(&self, repo_id: &str, revision: &str, filename: &str) -> PathBuf {
        self.model_dir(repo_id, revision).join(filename)
    }

    pub fn meta_path(&self, repo_id: &str, revision: &str, filename: &str) -> PathBuf {
        self.model_dir(repo_id, revision).join(format!("{filename}.meta.json"))
    }

    /// A file counts as cached once both the data and its sidecar exist.
    pub fn is_cached(&self, repo_id: &str, revision: &str, filename: &str) -> bool {
        self.file_path(repo_id, revision, filename).exists() && self.meta_path(repo_id, revision, filename).exists()
    }

    /// The subset of `required` that is not cached yet.
    pub fn missing_files(&self, repo_id: &str, revision: &str, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|f| !self.is_cached(repo_id, revision, f))
            .map(|f| f.to_string())
            .collect()
    }

    pub fn write_meta(&self, meta: &FileMetadata) -> HubResult<()> {
        let path = self.meta_path(&meta.repo_id, &meta.revision, &meta.filename);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(meta)?)?;
        debug!(path = %path.display(), "Wrote file metadata");
        Ok(())
    }

    pub fn read_meta(&self, repo_id: &str, revision: &str, filename: &str) -> HubResult<FileMetadata> {
        let json = std::fs::read_to_string(self.meta_path(repo_id, revision, filename))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Remove a cached file and its sidecar so the next pull fetches it again.
    pub fn evict(&self, repo_id: &str, revision: &str, filename: &str) -> HubResult<()> {
        for path in [self.file_path(repo_id, revision, filename), self.meta_path(repo_id, revision, filename)] {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Evicted from cache"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(filename: &str) -> FileMetadata {
        FileMetadata {
            repo_id: "state-spaces/mamba-130m-hf".to_string(),
            revision: "main".to_string(),
            filename: filename.to_string(),
            sha256: "deadbeef".to_string(),
            size_bytes: 1024,
        }
    }

    #[test]
    fn repo_slash_becomes_double_underscore() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::new(dir.path()).unwrap();
        let p = cache.file_path("state-spaces/mamba-130m-hf", "main", "config.json");
        assert_eq!(p, dir.path().join("state-spaces__mamba-130m-hf").join("main").join("config.json"));
        assert!(cache
            .meta_path("a/b", "main", "model.safetensors")
            .ends_with("a__b/main/model.safetensors.meta.json"));
    }

    #[test]
    fn metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::new(dir.path()).unwrap();
        cache.write_meta(&meta("config.json")).unwrap();
        let back = cache.read_meta("state-spaces/mamba-130m-hf", "main", "config.json").unwrap();
        assert_eq!(back, meta("config.json"));
    }

    #[test]
    fn file_without_sidecar_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::new(dir.path()).unwrap();
        let repo = "state-spaces/mamba-130m-hf";

        std::fs::create_dir_all(cache.model_dir(repo, "main")).unwrap();
        std::fs::write(cache.file_path(repo, "main", "config.json"), "{}").unwrap();
        assert!(!cache.is_cached(repo, "main", "config.json"));

        cache.write_meta(&meta("config.json")).unwrap();
        assert!(cache.is_cached(repo, "main", "config.json"));
        assert_eq!(
            cache.missing_files(repo, "main", &["config.json", "tokenizer.json"]),
            vec!["tokenizer.json".to_string()]
        );
    }

    #[test]
    fn evict_removes_data_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::new(dir.path()).unwrap();
        let repo = "state-spaces/mamba-130m-hf";
        std::fs::create_dir_all(cache.model_dir(repo, "main")).unwrap();
        std::fs::write(cache.file_path(repo, "main", "config.json"), "{}").unwrap();
        cache.write_meta(&meta("config.json")).unwrap();

        cache.evict(repo, "main", "config.json").unwrap();
        assert!(!cache.file_path(repo, "main", "config.json").exists());
        assert!(!cache.meta_path(repo, "main", "config.json").exists());
        // Evicting twice is harmless.
        cache.evict(repo, "main", "config.json").unwrap();
    }

    #[test]
    fn tilde_is_expanded() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/.cache/x")), home.join(".cache/x"));
        }
        assert_eq!(expand_tilde(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
    }
}
