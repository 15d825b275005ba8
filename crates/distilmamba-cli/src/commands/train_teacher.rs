//! `distilmamba train-teacher`: fine-tune the teacher classifier only.

use anyhow::Result;
use tracing::info;

use distilmamba_train::export::copy_tokenizer_files;
use distilmamba_train::{SequenceClassifier, TeacherTrainer, TrainingStats};

use super::Session;
use crate::config::AppConfig;

pub async fn run(config: &AppConfig) -> Result<()> {
    let mut session = Session::prepare(config).await?;
    let (_, stats) = train(&mut session, config)?;

    println!(
        "\nTeacher fine-tuning complete!\n\
         Best accuracy: {:.4} after {} epoch(s){}\n\
         Checkpoint: {}",
        stats.best_accuracy,
        stats.epochs_run,
        if stats.stopped_early { " (early stop)" } else { "" },
        stats.checkpoint.as_ref().map_or_else(|| "none written".to_string(), |p| p.display().to_string()),
    );
    Ok(())
}

/// Fine-tune the pretrained teacher once and return it with its stats.
pub(crate) fn train(session: &mut Session, config: &AppConfig) -> Result<(SequenceClassifier, TrainingStats)> {
    let output_dir = config.output_dir();
    copy_tokenizer_files(&session.model_dir, &output_dir)?;

    let teacher = session.pretrained_teacher()?;
    let mut trainer = TeacherTrainer::new(teacher, config.teacher.clone(), &output_dir);
    let stats = trainer.run(&mut session.train, &mut session.eval)?;
    info!(best_accuracy = stats.best_accuracy, epochs = stats.epochs_run, "Teacher ready");
    Ok((trainer.into_classifier(), stats))
}
