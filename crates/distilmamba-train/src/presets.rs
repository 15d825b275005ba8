//! Default run settings and the student architecture.
//!
//! | Model | Hidden | Layers | Params (tied head) |
//! |-------|--------|--------|--------------------|
//! | teacher `mamba-130m-hf` | 768 | 24 | ~130M |
//! | student | 384 | 6 | ~25M |
//!
//! The student keeps the teacher's vocabulary, state size, convolution width
//! and expansion factor so both consume identical token batches.

use anyhow::{Context, Result};
use tracing::info;

use distilmamba_core::MambaConfig;

/// Pretrained teacher base model on the Hugging Face Hub.
pub const DEFAULT_MODEL_ID: &str = "state-spaces/mamba-130m-hf";
pub const DEFAULT_MAX_LENGTH: usize = 64;
pub const DEFAULT_BATCH_SIZE: usize = 8;
/// Percentage of each split used for a run.
pub const DEFAULT_SUBSET_PERCENT: f64 = 1.0;

/// Student config derived from the teacher's: half the hidden size and a
/// quarter of the layers.
pub fn student_config(teacher: &MambaConfig) -> Result<MambaConfig> {
    teacher.validate().context("Invalid teacher config")?;
    let student = teacher.shrunk_for_student();
    student.validate().context("Teacher config is too small to shrink")?;
    info!(
        teacher_hidden = teacher.hidden_size,
        teacher_layers = teacher.num_hidden_layers,
        student_hidden = student.hidden_size,
        student_layers = student.num_hidden_layers,
        approx_student_params = approx_params(&student),
        "Derived student architecture"
    );
    Ok(student)
}

/// Parameter count of a Mamba model built from `cfg`.
pub fn approx_params(cfg: &MambaConfig) -> usize {
    let (h, v, n, k) = (cfg.hidden_size, cfg.vocab_size, cfg.state_size, cfg.conv_kernel);
    let (i, r) = (cfg.intermediate_size(), cfg.dt_rank());
    let bias = usize::from(cfg.use_bias);
    let mixer = i * n // A_log
        + i // D
        + i * k + if cfg.use_conv_bias { i } else { 0 }
        + h * 2 * i + bias * 2 * i // in_proj
        + i * (r + 2 * n) // x_proj
        + r * i + i // dt_proj
        + i * h + bias * h; // out_proj
    let per_layer = h + mixer;
    let head = if cfg.tie_word_embeddings { 0 } else { v * h };
    v * h + cfg.num_hidden_layers * per_layer + h + head
}
