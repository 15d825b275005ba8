use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

use distilmamba_core::MambaConfig;
use distilmamba_train::export::copy_tokenizer_files;
use distilmamba_train::presets::student_config;
use distilmamba_train::{
    evaluate, Distiller, ModelRole, RunManifest, SequenceClassifier, TrainingStats, TEACHER_CHECKPOINT,
};

use super::{require_dir, Session};
use crate::config::AppConfig;

/// `distilmamba distill`: restore the best teacher and distil it.
pub async fn run(config: &AppConfig) -> Result<()> {
    let output_dir = config.output_dir();
    require_dir(&output_dir)?;

    let mut session = Session::prepare(config).await?;
    let teacher = session.classifier(&session.teacher_config)?;
    let teacher_path = output_dir.join(TEACHER_CHECKPOINT);
    teacher
        .load(&teacher_path)
        .with_context(|| format!("Cannot load teacher checkpoint (run `train-teacher` first): {}", teacher_path.display()))?;

    let outcome = distill(&mut session, teacher, Some(teacher_path), config)?;
    let manifest = outcome.write_manifest(&session, config)?;

    println!(
        "\nDistillation complete!\n\
         Teacher accuracy: {:.4}\n\
         Student accuracy: {:.4} (best over {} epoch(s))\n\
         Manifest: {}",
        outcome.teacher_accuracy,
        outcome.stats.best_accuracy,
        outcome.stats.epochs_run,
        manifest.display(),
    );
    Ok(())
}

/// Result of one distillation pass.
pub(crate) struct Outcome {
    pub teacher: SequenceClassifier,
    pub student: SequenceClassifier,
    pub student_config: MambaConfig,
    pub stats: TrainingStats,
    pub teacher_accuracy: f64,
    /// Where the distilled teacher came from, if it was ever saved.
    pub teacher_checkpoint: Option<PathBuf>,
}

impl Outcome {
    pub fn write_manifest(&self, session: &Session, config: &AppConfig) -> Result<PathBuf> {
        let output_dir = config.output_dir();
        copy_tokenizer_files(&session.model_dir, &output_dir)?;

        let mut manifest = RunManifest::new(
            &config.model.id,
            session.teacher_config.clone(),
            self.student_config.clone(),
            session.pooling,
            config.data.max_length,
        );
        manifest.teacher_accuracy = Some(self.teacher_accuracy);
        manifest.student_accuracy = Some(self.stats.best_accuracy);
        if self.teacher_checkpoint.is_none() {
            warn!("No teacher checkpoint was saved; the manifest cannot restore the teacher");
            manifest.clear_checkpoint(ModelRole::Teacher);
        }
        if self.stats.checkpoint.is_none() {
            warn!("No student epoch scored above zero; the manifest cannot restore the student");
            manifest.clear_checkpoint(ModelRole::Student);
        }
        manifest.write(&output_dir)
    }
}

/// Build a fresh student from the shrunk teacher config and distil into it.
pub(crate) fn distill(
    session: &mut Session,
    mut teacher: SequenceClassifier,
    teacher_checkpoint: Option<PathBuf>,
    config: &AppConfig,
) -> Result<Outcome> {
    let teacher_accuracy = evaluate(&mut teacher, &mut session.eval)
        .context("Teacher evaluation failed")?
        .accuracy;

    let student_config = student_config(&session.teacher_config)?;
    info!(teacher_accuracy, "Teacher restored for distillation");
    let student = session.classifier(&student_config)?;

    let mut distiller = Distiller::new(teacher, student, config.distill.clone(), &config.output_dir());
    let stats = distiller.run(&mut session.train, &mut session.eval)?;
    let (teacher, student) = distiller.into_parts();

    Ok(Outcome { teacher, student, student_config, stats, teacher_accuracy, teacher_checkpoint })
}
