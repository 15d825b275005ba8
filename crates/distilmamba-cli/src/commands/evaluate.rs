use anyhow::{Context, Result};

use distilmamba_core::{select_device, Tokenizer};
use distilmamba_train::{evaluate, ModelRole, RunManifest};

use super::{check_vocab, load_loaders, print_report, require_dir};
use crate::config::AppConfig;

/// Accuracy and prediction distribution of both saved classifiers.
pub fn run(config: &AppConfig) -> Result<()> {
    let output_dir = config.output_dir();
    require_dir(&output_dir)?;

    let manifest = RunManifest::read(&output_dir)?;
    let device = select_device(config.device.prefer_gpu, config.device.cuda_device_id)?;
    let tokenizer = Tokenizer::from_dir(&output_dir)
        .with_context(|| format!("Failed to load tokenizer from {}", output_dir.display()))?;
    check_vocab(&tokenizer, &manifest.teacher)?;
    let (_, mut eval) = load_loaders(config, &tokenizer, manifest.max_length, &device)?;

    for role in [ModelRole::Teacher, ModelRole::Student] {
        let mut model = manifest.load_classifier(&output_dir, role, &device)?;
        let report = evaluate(&mut model, &mut eval).with_context(|| format!("{role} evaluation failed"))?;
        report.log(&role.to_string());
        print_report(&format!("{role} ({} examples)", report.total), &report);
    }
    Ok(())
}
