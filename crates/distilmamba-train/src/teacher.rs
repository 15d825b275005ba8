//! Supervised fine-tuning of the teacher classifier.
//!
//! The head trains at the full learning rate and the unfrozen tail of the
//! base model at a tenth of it. Every step clips the gradient norm before the
//! optimiser runs; every epoch is evaluated, the best weights are written to
//! disk and training stops once accuracy has not improved for `patience`
//! epochs in a row.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use distilmamba_core::{Mamba, SequenceModel};

use crate::classifier::SequenceClassifier;
use crate::dataset::DataLoader;
use crate::early_stop::{EarlyStopping, Verdict};
use crate::eval::{evaluate, EvalReport};
use crate::optim::{clip_grad_norm, GroupedAdamW, ParamGroup};
use crate::progress::{format_duration, progress_bar};
use crate::schedule::CosineWithWarmup;

pub const TEACHER_CHECKPOINT: &str = "best_teacher.safetensors";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeacherConfig {
    pub epochs: usize,
    /// Learning rate of the projection and classification head.
    pub learning_rate: f64,
    /// Multiplier applied to `learning_rate` for trainable base tensors.
    pub base_lr_scale: f64,
    pub weight_decay: f64,
    pub patience: usize,
    pub max_grad_norm: f64,
}

impl Default for TeacherConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            learning_rate: 5e-5,
            base_lr_scale: 0.1,
            weight_decay: 0.01,
            patience: 3,
            max_grad_norm: 1.0,
        }
    }
}

/// Summary returned after a training loop finishes.
#[derive(Debug, Clone)]
pub struct TrainingStats {
    pub best_accuracy: f64,
    pub epochs_run: usize,
    pub stopped_early: bool,
    /// Batches processed.
    pub total_steps: usize,
    /// Optimiser updates applied.
    pub updates: usize,
    /// Accumulated micro-batch gradients not yet applied when training ended.
    pub pending_micro_steps: usize,
    pub final_loss: f32,
    pub elapsed_secs: f64,
    /// Evaluation of every completed epoch, in order.
    pub history: Vec<EvalReport>,
    /// Written only when some epoch scored above zero.
    pub checkpoint: Option<PathBuf>,
}

/// Owns the teacher classifier for the duration of fine-tuning.
pub struct TeacherTrainer<M: SequenceModel = Mamba> {
    classifier: SequenceClassifier<M>,
    config: TeacherConfig,
    checkpoint_path: PathBuf,
}

impl<M: SequenceModel> TeacherTrainer<M> {
    /// `output_dir` receives [`TEACHER_CHECKPOINT`]; it is created on first save.
    pub fn new(classifier: SequenceClassifier<M>, config: TeacherConfig, output_dir: &Path) -> Self {
        Self { classifier, config, checkpoint_path: output_dir.join(TEACHER_CHECKPOINT) }
    }

    pub fn classifier(&self) -> &SequenceClassifier<M> {
        &self.classifier
    }

    /// Hand back the classifier as it stands after the last epoch.
    pub fn into_classifier(self) -> SequenceClassifier<M> {
        self.classifier
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    pub fn run(&mut self, train: &mut DataLoader, eval: &mut DataLoader) -> Result<TrainingStats> {
        let cfg = self.config.clone();
        anyhow::ensure!(cfg.epochs > 0, "teacher epochs must be positive");

        let head = self.classifier.head_vars();
        let base = self.classifier.trainable_base_vars();
        let mut clip_vars = head.clone();
        clip_vars.extend(base.iter().cloned());
        let mut optimizer = GroupedAdamW::new(
            vec![
                ParamGroup { name: "head", vars: head, learning_rate: cfg.learning_rate },
                ParamGroup { name: "base", vars: base, learning_rate: cfg.learning_rate * cfg.base_lr_scale },
            ],
            cfg.weight_decay,
        )
        .context("Failed to create teacher optimiser")?;

        let batches_per_epoch = train.num_batches();
        let mut schedule = CosineWithWarmup::with_warmup_ratio(batches_per_epoch * cfg.epochs);
        let mut early_stop = EarlyStopping::new(cfg.patience);

        info!(
            examples = train.len(),
            epochs = cfg.epochs,
            batches_per_epoch,
            warmup_steps = schedule.warmup_steps(),
            lr = cfg.learning_rate,
            base_lr = cfg.learning_rate * cfg.base_lr_scale,
            trainable_tensors = clip_vars.len(),
            "Fine-tuning teacher"
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
            self.classifier.train();
            let pb = progress_bar(batches_per_epoch as u64, "Teacher training");
            let mut epoch_loss = 0f64;
            let mut seen = 0usize;

            for batch in train.epoch() {
                let batch = batch?;
                let out = self
                    .classifier
                    .forward(&batch.input_ids, Some(&batch.attention_mask), Some(&batch.labels))
                    .context("Teacher forward pass failed")?;
                let loss = out.loss.context("Classifier returned no loss for a labelled batch")?;

                let mut grads = loss.backward().context("Teacher backward pass failed")?;
                let grad_norm = clip_grad_norm(&mut grads, &clip_vars, cfg.max_grad_norm)?;
                optimizer.set_lr_factor(schedule.factor());
                optimizer.step(&grads)?;
                schedule.step();
                stats.updates += 1;

                let loss_val = loss.to_scalar::<f32>()?;
                stats.final_loss = loss_val;
                stats.total_steps += 1;
                epoch_loss += loss_val as f64;
                seen += 1;

                debug!(epoch, step = stats.total_steps, loss = loss_val, grad_norm, "Teacher step");
                let lr = optimizer.learning_rates().first().map_or(0.0, |&(_, lr)| lr);
                pb.set_message(format!("epoch {epoch}/{} loss {loss_val:.4} lr {lr:.2e}", cfg.epochs));
                pb.inc(1);
            }
            pb.finish_and_clear();

            let report = evaluate(&mut self.classifier, eval).context("Teacher evaluation failed")?;
            let verdict = early_stop.observe(report.accuracy);
            info!(
                epoch,
                mean_loss = epoch_loss / seen.max(1) as f64,
                accuracy = report.accuracy,
                best = early_stop.best(),
                epochs_without_improvement = early_stop.epochs_without_improvement(),
                "Teacher epoch complete"
            );
            stats.history.push(report);
            stats.epochs_run = epoch;

            match verdict {
                Verdict::Improved => {
                    self.classifier.save(&self.checkpoint_path)?;
                    stats.checkpoint = Some(self.checkpoint_path.clone());
                    info!(path = %self.checkpoint_path.display(), accuracy = early_stop.best(), "Saved best teacher");
                }
                Verdict::Continue => {}
                Verdict::Stop => {
                    info!(epoch, patience = cfg.patience, "Early stopping");
                    stats.stopped_early = true;
                    break;
                }
            }
        }

        stats.best_accuracy = early_stop.best();
        stats.elapsed_secs = start.elapsed().as_secs_f64();
        info!(
            best_accuracy = stats.best_accuracy,
            epochs = stats.epochs_run,
            elapsed = %format_duration(stats.elapsed_secs as u64),
            "Teacher fine-tuning finished"
        );
        Ok(stats)
    }
}
