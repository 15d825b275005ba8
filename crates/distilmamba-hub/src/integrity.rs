use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cache::ModelCache;
use crate::error::{HubError, HubResult};

/// SHA-256 hex digest of a file, read in 1 MiB chunks.
pub fn sha256_file(path: &Path) -> HubResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare a file against an expected hex digest (case-insensitive).
pub fn verify_integrity(path: &Path, expected_sha256: &str) -> HubResult<()> {
    let actual = sha256_file(path)?;
    debug!(path = %path.display(), expected = expected_sha256, actual = %actual, "Verifying file integrity");
    if actual.eq_ignore_ascii_case(expected_sha256) {
        Ok(())
    } else {
        Err(HubError::IntegrityMismatch {
            file: path.to_string_lossy().to_string(),
            expected: expected_sha256.to_string(),
            actual,
        })
    }
}

/// Re-hash a cached file and compare it with the digest in its sidecar.
pub fn verify_cached(cache: &ModelCache, repo_id: &str, revision: &str, filename: &str) -> HubResult<()> {
    let meta = cache.read_meta(repo_id, revision, filename)?;
    verify_integrity(&cache.file_path(repo_id, revision, filename), &meta.sha256)
}

/// Check every listed file against its sidecar digest and evict the ones
/// that fail (truncated, tampered, or missing metadata). Returns the names
/// of the evicted files.
pub fn evict_corrupt(cache: &ModelCache, repo_id: &str, revision: &str, filenames: &[String]) -> HubResult<Vec<String>> {
    let mut evicted = Vec::new();
    for filename in filenames {
        if let Err(e) = verify_cached(cache, repo_id, revision, filename) {
            warn!(filename = %filename, error = %e, "Cached file failed verification, evicting");
            cache.evict(repo_id, revision, filename)?;
            evicted.push(filename.clone());
        }
    }
    Ok(evicted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FileMetadata;

    const HELLO_SHA: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn known_digests() {
        let dir = tempfile::tempdir().unwrap();
        let hello = dir.path().join("hello.txt");
        let empty = dir.path().join("empty.txt");
        std::fs::write(&hello, b"hello").unwrap();
        std::fs::write(&empty, b"").unwrap();

        assert_eq!(sha256_file(&hello).unwrap(), HELLO_SHA);
        assert_eq!(
            sha256_file(&empty).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn verification_is_case_insensitive_and_detects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        assert!(verify_integrity(&path, &HELLO_SHA.to_uppercase()).is_ok());
        assert!(matches!(
            verify_integrity(&path, &"0".repeat(64)),
            Err(HubError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn cached_file_is_checked_against_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::new(dir.path()).unwrap();
        let path = cache.file_path("o/m", "main", "config.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"hello").unwrap();
        cache
            .write_meta(&FileMetadata {
                repo_id: "o/m".into(),
                revision: "main".into(),
                filename: "config.json".into(),
                sha256: HELLO_SHA.into(),
                size_bytes: 5,
            })
            .unwrap();
        verify_cached(&cache, "o/m", "main", "config.json").unwrap();

        std::fs::write(&path, b"tampered").unwrap();
        assert!(verify_cached(&cache, "o/m", "main", "config.json").is_err());
    }

    fn cache_file(cache: &ModelCache, filename: &str, contents: &[u8]) {
        let path = cache.file_path("o/m", "main", filename);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, contents).unwrap();
        cache
            .write_meta(&FileMetadata {
                repo_id: "o/m".into(),
                revision: "main".into(),
                filename: filename.into(),
                sha256: sha256_file(&path).unwrap(),
                size_bytes: contents.len() as u64,
            })
            .unwrap();
    }

    #[test]
    fn truncated_weights_are_evicted_and_intact_files_kept() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::new(dir.path()).unwrap();
        cache_file(&cache, "config.json", b"{}");
        cache_file(&cache, "model.safetensors", &[7u8; 4096]);

        // An interrupted rewrite leaves a short file behind the old sidecar.
        std::fs::write(cache.file_path("o/m", "main", "model.safetensors"), [7u8; 100]).unwrap();

        let files = vec!["config.json".to_string(), "model.safetensors".to_string()];
        let evicted = evict_corrupt(&cache, "o/m", "main", &files).unwrap();
        assert_eq!(evicted, vec!["model.safetensors".to_string()]);
        assert!(cache.is_cached("o/m", "main", "config.json"));
        assert!(!cache.file_path("o/m", "main", "model.safetensors").exists());
        assert_eq!(cache.missing_files("o/m", "main", &["config.json", "model.safetensors"]), vec!["model.safetensors"]);
    }

    #[test]
    fn file_without_sidecar_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::new(dir.path()).unwrap();
        let path = cache.file_path("o/m", "main", "model.safetensors");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"weights").unwrap();

        let evicted = evict_corrupt(&cache, "o/m", "main", &["model.safetensors".to_string()]).unwrap();
        assert_eq!(evicted.len(), 1);
        assert!(!path.exists());
    }
}
