use anyhow::{Context, Result};

use distilmamba_core::{select_device, Tokenizer};
use distilmamba_train::predict::DEFAULT_TEXTS;
use distilmamba_train::{predict_text, Emotion, ModelRole, RunManifest};

use super::{check_vocab, require_dir};
use crate::config::AppConfig;

/// Classify each text with the saved teacher and student.
pub fn run(texts: &[String], config: &AppConfig) -> Result<()> {
    let output_dir = config.output_dir();
    require_dir(&output_dir)?;

    let texts: Vec<String> = if texts.is_empty() {
        DEFAULT_TEXTS.iter().map(|t| t.to_string()).collect()
    } else {
        texts.to_vec()
    };

    let manifest = RunManifest::read(&output_dir)?;
    let device = select_device(config.device.prefer_gpu, config.device.cuda_device_id)?;
    let tokenizer = Tokenizer::from_dir(&output_dir)
        .with_context(|| format!("Failed to load tokenizer from {}", output_dir.display()))?;
    check_vocab(&tokenizer, &manifest.teacher)?;
    let mut teacher = manifest.load_classifier(&output_dir, ModelRole::Teacher, &device)?;
    let mut student = manifest.load_classifier(&output_dir, ModelRole::Student, &device)?;

    for text in &texts {
        println!("\nText: {text}");
        let predictions = [
            (ModelRole::Teacher, predict_text(&mut teacher, &tokenizer, text)?),
            (ModelRole::Student, predict_text(&mut student, &tokenizer, text)?),
        ];
        for (role, prediction) in predictions {
            println!("  {role}: {} (confidence {:.4})", prediction.label, prediction.confidence());
            let probs = prediction
                .probabilities
                .iter()
                .enumerate()
                .map(|(i, p)| format!("{}={p:.3}", Emotion::from_index(i).map_or("?", |e| e.name())))
                .collect::<Vec<_>>()
                .join(" ");
            println!("    {probs}");
        }
    }
    Ok(())
}
