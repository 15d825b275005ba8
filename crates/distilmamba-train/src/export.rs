//! Run output directory.
//!
//! After distillation the output directory holds everything needed to
//! rebuild both classifiers without the original model cache:
//!
//! ```text
//! <output_dir>/
//!   best_teacher.safetensors   full teacher classifier state
//!   best_student.safetensors   full student classifier state
//!   manifest.json              architectures, pooling, labels, accuracies
//!   tokenizer.json             copied from the base model directory
//!   tokenizer_config.json      (optional) copied as well
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use distilmamba_core::MambaConfig;

use crate::classifier::{PoolingMode, SequenceClassifier};
use crate::distiller::STUDENT_CHECKPOINT;
use crate::freeze::FreezePolicy;
use crate::labels::{Emotion, NUM_LABELS};
use crate::teacher::TEACHER_CHECKPOINT;

pub const MANIFEST_FILE: &str = "manifest.json";

const TOKENIZER_FILES: [(&str, bool); 3] =
    [("tokenizer.json", true), ("tokenizer_config.json", false), ("special_tokens_map.json", false)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Teacher,
    Student,
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelRole::Teacher => "teacher",
            ModelRole::Student => "student",
        })
    }
}

/// Everything needed to rebuild the trained classifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Hub id of the pretrained teacher base.
    pub base_model: String,
    pub teacher: MambaConfig,
    pub student: MambaConfig,
    pub pooling: PoolingMode,
    pub freeze: FreezePolicy,
    /// Class names in label-index order.
    pub labels: Vec<String>,
    pub max_length: usize,
    /// `None` when no epoch scored above zero and nothing was saved.
    #[serde(default)]
    pub teacher_checkpoint: Option<String>,
    #[serde(default)]
    pub student_checkpoint: Option<String>,
    #[serde(default)]
    pub teacher_accuracy: Option<f64>,
    #[serde(default)]
    pub student_accuracy: Option<f64>,
}

impl RunManifest {
    pub fn new(base_model: &str, teacher: MambaConfig, student: MambaConfig, pooling: PoolingMode, max_length: usize) -> Self {
        Self {
            base_model: base_model.to_string(),
            teacher,
            student,
            pooling,
            freeze: FreezePolicy::default(),
            labels: Emotion::names(),
            max_length,
            teacher_checkpoint: Some(TEACHER_CHECKPOINT.to_string()),
            student_checkpoint: Some(STUDENT_CHECKPOINT.to_string()),
            teacher_accuracy: None,
            student_accuracy: None,
        }
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).with_context(|| format!("Cannot create output dir: {}", dir.display()))?;
        let path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).with_context(|| format!("Cannot write {}", path.display()))?;
        info!(path = %path.display(), "Run manifest written");
        Ok(path)
    }

    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Cannot read {} (run `distill` first)", path.display()))?;
        let manifest: Self =
            serde_json::from_str(&text).with_context(|| format!("Invalid manifest {}", path.display()))?;
        anyhow::ensure!(
            manifest.labels.len() == NUM_LABELS,
            "manifest lists {} labels, expected {NUM_LABELS}",
            manifest.labels.len()
        );
        Ok(manifest)
    }

    pub fn config(&self, role: ModelRole) -> &MambaConfig {
        match role {
            ModelRole::Teacher => &self.teacher,
            ModelRole::Student => &self.student,
        }
    }

    pub fn checkpoint(&self, dir: &Path, role: ModelRole) -> Option<PathBuf> {
        let file = match role {
            ModelRole::Teacher => &self.teacher_checkpoint,
            ModelRole::Student => &self.student_checkpoint,
        };
        file.as_ref().map(|f| dir.join(f))
    }

    /// Record that training never saved a checkpoint for `role`.
    pub fn clear_checkpoint(&mut self, role: ModelRole) {
        match role {
            ModelRole::Teacher => self.teacher_checkpoint = None,
            ModelRole::Student => self.student_checkpoint = None,
        }
    }

    /// Rebuild one classifier and strictly load its checkpoint from `dir`.
    pub fn load_classifier(&self, dir: &Path, role: ModelRole, device: &Device) -> Result<SequenceClassifier> {
        let classifier =
            SequenceClassifier::mamba(self.config(role), self.labels.len(), self.pooling, self.freeze, device)?;
        let path = self
            .checkpoint(dir, role)
            .with_context(|| format!("No {role} checkpoint was saved: no epoch scored above zero accuracy"))?;
        classifier.load(&path).with_context(|| format!("Cannot restore {role} classifier"))?;
        info!(%role, path = %path.display(), "Classifier restored");
        Ok(classifier)
    }
}

/// Copy the tokenizer files from a model directory; `tokenizer.json` must
/// exist, the others are copied when present.
pub fn copy_tokenizer_files(src_dir: &Path, dst_dir: &Path) -> Result<usize> {
    std::fs::create_dir_all(dst_dir).with_context(|| format!("Cannot create output dir: {}", dst_dir.display()))?;
    let mut copied = 0;
    for (name, required) in TOKENIZER_FILES {
        let src = src_dir.join(name);
        if !src.exists() {
            anyhow::ensure!(!required, "{name} not found in {}", src_dir.display());
            debug!(file = name, "Optional tokenizer file absent");
            continue;
        }
        std::fs::copy(&src, dst_dir.join(name)).with_context(|| format!("Failed to copy {name}"))?;
        debug!(file = name, "Tokenizer file copied");
        copied += 1;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::classifier::tests::tiny_config;

    #[test]
    fn manifest_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let teacher = tiny_config();
        let mut m = RunManifest::new("state-spaces/mamba-130m-hf", teacher.clone(), teacher.shrunk_for_student(), PoolingMode::Max, 64);
        m.teacher_accuracy = Some(0.5);
        m.write(dir.path()).unwrap();

        let back = RunManifest::read(dir.path()).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.labels[3], "anger");
        assert_eq!(back.checkpoint(dir.path(), ModelRole::Student), Some(dir.path().join("best_student.safetensors")));
    }

    #[test]
    fn unsaved_checkpoint_is_recorded_and_refused() {
        let dir = TempDir::new().unwrap();
        let mut m = RunManifest::new("x", tiny_config(), tiny_config().shrunk_for_student(), PoolingMode::Mean, 8);
        m.clear_checkpoint(ModelRole::Student);
        m.write(dir.path()).unwrap();

        let back = RunManifest::read(dir.path()).unwrap();
        assert_eq!(back.student_checkpoint, None);
        assert_eq!(back.checkpoint(dir.path(), ModelRole::Student), None);
        assert!(back.checkpoint(dir.path(), ModelRole::Teacher).is_some());
        let err = back.load_classifier(dir.path(), ModelRole::Student, &Device::Cpu).unwrap_err();
        assert!(err.to_string().contains("No student checkpoint"), "{err:#}");
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(RunManifest::read(dir.path()).is_err());
    }

    #[test]
    fn tokenizer_json_is_required() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        assert!(copy_tokenizer_files(src.path(), dst.path()).is_err());

        std::fs::write(src.path().join("tokenizer.json"), "{}").unwrap();
        std::fs::write(src.path().join("tokenizer_config.json"), "{}").unwrap();
        assert_eq!(copy_tokenizer_files(src.path(), dst.path()).unwrap(), 2);
        assert!(dst.path().join("tokenizer_config.json").exists());
    }

    #[test]
    fn load_classifier_requires_checkpoint() {
        let dir = TempDir::new().unwrap();
        let m = RunManifest::new("x", tiny_config(), tiny_config().shrunk_for_student(), PoolingMode::Mean, 8);
        assert!(m.load_classifier(dir.path(), ModelRole::Teacher, &Device::Cpu).is_err());
    }
}
