//! Distillation orchestrator.
//!
//! The frozen teacher scores every batch first; its logits are detached and
//! serve as soft targets for the student, blended with the hard labels by
//! [`distillation_loss`]. Each step's loss is divided by the accumulation
//! count and the gradients summed, so one optimiser update sees the mean over
//! `gradient_accumulation_steps` batches. The accumulation counter restarts
//! every epoch while unapplied gradients carry over into the next update.
//!
//! Unlike teacher fine-tuning there is no early stopping: every epoch runs,
//! and the student weights are written whenever accuracy improves.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use distilmamba_core::{Mamba, SequenceModel};

use crate::classifier::SequenceClassifier;
use crate::dataset::DataLoader;
use crate::eval::evaluate;
use crate::loss::distillation_loss;
use crate::optim::{clip_grad_norm, GradAccumulator, GroupedAdamW, ParamGroup};
use crate::progress::{format_duration, progress_bar};
use crate::schedule::CosineWithWarmup;
use crate::teacher::TrainingStats;

pub const STUDENT_CHECKPOINT: &str = "best_student.safetensors";

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Batches whose gradients are summed before one optimiser update.
    pub gradient_accumulation_steps: usize,
    /// Softening temperature applied to both logit sets.
    pub temperature: f64,
    /// Weight of the soft-target term; `1 - alpha` weights the label term.
    pub alpha: f64,
    pub max_grad_norm: f64,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            learning_rate: 1e-4,
            weight_decay: 0.01,
            gradient_accumulation_steps: 2,
            temperature: 2.0,
            alpha: 0.5,
            max_grad_norm: 1.0,
        }
    }
}

// ── Distiller ─────────────────────────────────────────────────────────────────

pub struct Distiller<T: SequenceModel = Mamba, S: SequenceModel = Mamba> {
    teacher: SequenceClassifier<T>,
    student: SequenceClassifier<S>,
    config: DistillConfig,
    checkpoint_path: PathBuf,
}

impl<T: SequenceModel, S: SequenceModel> Distiller<T, S> {
    /// `output_dir` receives [`STUDENT_CHECKPOINT`].
    pub fn new(
        teacher: SequenceClassifier<T>,
        student: SequenceClassifier<S>,
        config: DistillConfig,
        output_dir: &Path,
    ) -> Self {
        Self { teacher, student, config, checkpoint_path: output_dir.join(STUDENT_CHECKPOINT) }
    }

    pub fn teacher(&self) -> &SequenceClassifier<T> {
        &self.teacher
    }

    pub fn student(&self) -> &SequenceClassifier<S> {
        &self.student
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    /// Consume the distiller and return `(teacher, student)`.
    pub fn into_parts(self) -> (SequenceClassifier<T>, SequenceClassifier<S>) {
        (self.teacher, self.student)
    }

    pub fn run(&mut self, train: &mut DataLoader, eval: &mut DataLoader) -> Result<TrainingStats> {
        let cfg = self.config.clone();
        anyhow::ensure!(cfg.epochs > 0, "distillation epochs must be positive");
        anyhow::ensure!(cfg.gradient_accumulation_steps > 0, "gradient_accumulation_steps must be positive");
        let accumulation = cfg.gradient_accumulation_steps;

        let vars = self.student.trainable_vars();
        let mut optimizer = GroupedAdamW::new(
            vec![ParamGroup { name: "student", vars: vars.clone(), learning_rate: cfg.learning_rate }],
            cfg.weight_decay,
        )
        .context("Failed to create student optimiser")?;
        let mut accumulator = GradAccumulator::new(vars);

        // Counts batches, not optimiser updates.
        let batches_per_epoch = train.num_batches();
        let mut schedule = CosineWithWarmup::with_warmup_ratio(batches_per_epoch * cfg.epochs);

        self.teacher.eval();
        info!(
            examples = train.len(),
            epochs = cfg.epochs,
            batches_per_epoch,
            accumulation,
            temperature = cfg.temperature,
            alpha = cfg.alpha,
            lr = cfg.learning_rate,
            teacher_params = self.teacher.base().num_parameters(),
            student_params = self.student.base().num_parameters(),
            "Distilling student"
        );

        let start = Instant::now();
        let mut stats = TrainingStats {
            best_accuracy: 0.0,
            epochs_run: 0,
            stopped_early: false,
            total_steps: 0,
            updates: 0,
            pending_micro_steps: 0,
            final_loss: f32::NAN,
            elapsed_secs: 0.0,
            history: Vec::with_capacity(cfg.epochs),
            checkpoint: None,
        };

        for epoch in 1..=cfg.epochs {
            self.student.train();
            let pb = progress_bar(batches_per_epoch as u64, "Distillation");
            let mut epoch_loss = 0f64;
            let mut seen = 0usize;

            for (step, batch) in train.epoch().enumerate() {
                let batch = batch?;
                let teacher_logits = self
                    .teacher
                    .forward(&batch.input_ids, Some(&batch.attention_mask), None)
                    .context("Teacher forward pass failed")?
                    .logits
                    .detach();
                let student = self
                    .student
                    .forward(&batch.input_ids, Some(&batch.attention_mask), None)
                    .context("Student forward pass failed")?;

                let loss = distillation_loss(&student.logits, &teacher_logits, &batch.labels, cfg.temperature, cfg.alpha)?;
                let scaled = loss.affine(1.0 / accumulation as f64, 0.0)?;
                accumulator.add(scaled.backward().context("Student backward pass failed")?)?;

                if (step + 1) % accumulation == 0 {
                    if let Some(mut grads) = accumulator.take() {
                        let grad_norm = clip_grad_norm(&mut grads, accumulator.vars(), cfg.max_grad_norm)?;
                        optimizer.set_lr_factor(schedule.factor());
                        optimizer.step(&grads)?;
                        schedule.step();
                        stats.updates += 1;
                        debug!(epoch, update = stats.updates, grad_norm, "Student update");
                    }
                }

                let loss_val = loss.to_scalar::<f32>()?;
                stats.final_loss = loss_val;
                stats.total_steps += 1;
                epoch_loss += loss_val as f64;
                seen += 1;
                let lr = optimizer.learning_rates().first().map_or(0.0, |&(_, lr)| lr);
                pb.set_message(format!("epoch {epoch}/{} loss {loss_val:.4} lr {lr:.2e}", cfg.epochs));
                pb.inc(1);
            }
            pb.finish_and_clear();

            let report = evaluate(&mut self.student, eval).context("Student evaluation failed")?;
            info!(
                epoch,
                mean_loss = epoch_loss / seen.max(1) as f64,
                accuracy = report.accuracy,
                pending_micro_steps = accumulator.micro_steps(),
                "Distillation epoch complete"
            );
            report.log("student");

            if report.accuracy > stats.best_accuracy {
                stats.best_accuracy = report.accuracy;
                self.student.save(&self.checkpoint_path)?;
                stats.checkpoint = Some(self.checkpoint_path.clone());
                info!(path = %self.checkpoint_path.display(), accuracy = report.accuracy, "Saved best student");
            }
            stats.history.push(report);
            stats.epochs_run = epoch;
        }

        stats.pending_micro_steps = accumulator.micro_steps();
        stats.elapsed_secs = start.elapsed().as_secs_f64();
        info!(
            best_accuracy = stats.best_accuracy,
            updates = stats.updates,
            pending_micro_steps = stats.pending_micro_steps,
            elapsed = %format_duration(stats.elapsed_secs as u64),
            "Distillation finished"
        );
        Ok(stats)
    }
}
