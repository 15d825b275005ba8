//! # distilmamba-train
//!
//! Teacher fine-tuning and knowledge distillation of Mamba sequence
//! classifiers on the six-class emotion dataset.
//!
//! 1. **Teacher**: a pretrained Mamba base wrapped in a
//!    [`SequenceClassifier`] is fine-tuned with cross-entropy. Only the
//!    classification head and the last two base tensors train; the best
//!    epoch is written to `best_teacher.safetensors`.
//! 2. **Student**: a randomly initialised Mamba with half the width and a
//!    quarter of the depth learns from the frozen teacher's softened logits
//!    blended with the hard labels; the best epoch is written to
//!    `best_student.safetensors`.
//!
//! ## Usage
//!
//! ```text
//! distilmamba pull
//! distilmamba run --data ./emotion --output ./output
//! distilmamba predict --output ./output "I feel happy today!"
//! ```

pub mod classifier;
pub mod dataset;
pub mod distiller;
pub mod early_stop;
pub mod eval;
pub mod export;
pub mod freeze;
pub mod labels;
pub mod loss;
pub mod optim;
pub mod predict;
pub mod presets;
pub mod schedule;
pub mod teacher;

mod progress;


pub use classifier::{ClassifierOutput, PoolingMode, SequenceClassifier};
pub use dataset::{DataLoader, EncodedDataset, Split};
pub use distiller::{DistillConfig, Distiller, STUDENT_CHECKPOINT};
pub use eval::{evaluate, EvalReport, PredictionDistribution};
pub use export::{ModelRole, RunManifest};
pub use freeze::FreezePolicy;
pub use labels::{Emotion, NUM_LABELS};
pub use predict::{predict_text, Prediction};
pub use teacher::{TeacherConfig, TeacherTrainer, TrainingStats, TEACHER_CHECKPOINT};
