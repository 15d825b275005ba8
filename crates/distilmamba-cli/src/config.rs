use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use distilmamba_hub::cache::expand_tilde;
use distilmamba_train::{presets, DistillConfig, PoolingMode, TeacherConfig};

/// Full runtime configuration loaded from TOML + env vars.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub teacher: TeacherConfig,
    #[serde(default)]
    pub distill: DistillConfig,
    pub output: OutputConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    /// Hugging Face repo id of the pretrained teacher base.
    pub id: String,
    pub revision: String,
    pub cache_dir: String,
    /// Sequence reduction before the classification head.
    #[serde(default)]
    pub pooling: PoolingMode,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataConfig {
    /// Directory holding `train.jsonl` and `test.jsonl`.
    pub dir: String,
    pub max_length: usize,
    /// Share of every split used, in percent.
    pub subset_percent: f64,
    pub batch_size: usize,
    pub shuffle_seed: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    pub dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub prefer_gpu: bool,
    pub cuda_device_id: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig {
                id: presets::DEFAULT_MODEL_ID.to_string(),
                revision: "main".to_string(),
                cache_dir: "~/.cache/distilmamba".to_string(),
                pooling: PoolingMode::Mean,
            },
            data: DataConfig {
                dir: "data/emotion".to_string(),
                max_length: presets::DEFAULT_MAX_LENGTH,
                subset_percent: presets::DEFAULT_SUBSET_PERCENT,
                batch_size: presets::DEFAULT_BATCH_SIZE,
                shuffle_seed: 42,
            },
            teacher: TeacherConfig::default(),
            distill: DistillConfig::default(),
            output: OutputConfig { dir: "output".to_string() },
            device: DeviceConfig { prefer_gpu: true, cuda_device_id: 0 },
        }
    }
}

impl AppConfig {
    pub fn cache_dir(&self) -> PathBuf {
        expand_tilde(Path::new(&self.model.cache_dir))
    }

    pub fn data_dir(&self) -> PathBuf {
        expand_tilde(Path::new(&self.data.dir))
    }

    pub fn output_dir(&self) -> PathBuf {
        expand_tilde(Path::new(&self.output.dir))
    }
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables prefixed with `DISTILMAMBA__`
pub fn load_config(config_file: Option<&PathBuf>) -> Result<AppConfig, ConfigError> {
    let defaults = AppConfig::default();
    let mut builder = Config::builder()
        // Layer 1: defaults baked in
        .set_default("model.id", defaults.model.id)?
        .set_default("model.revision", defaults.model.revision)?
        .set_default("model.cache_dir", defaults.model.cache_dir)?
        .set_default("model.pooling", "mean")?
        .set_default("data.dir", defaults.data.dir)?
        .set_default("data.max_length", defaults.data.max_length as i64)?
        .set_default("data.subset_percent", defaults.data.subset_percent)?
        .set_default("data.batch_size", defaults.data.batch_size as i64)?
        .set_default("data.shuffle_seed", defaults.data.shuffle_seed as i64)?
        .set_default("output.dir", defaults.output.dir)?
        .set_default("device.prefer_gpu", defaults.device.prefer_gpu)?
        .set_default("device.cuda_device_id", defaults.device.cuda_device_id as i64)?
        // Layer 2: project default.toml
        .add_source(File::with_name("config/default").required(false));

    // Layer 3: optional user-supplied config file
    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    // Layer 4: environment variables (DISTILMAMBA__DATA__BATCH_SIZE, etc.)
    builder = builder.add_source(
        Environment::with_prefix("DISTILMAMBA")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
