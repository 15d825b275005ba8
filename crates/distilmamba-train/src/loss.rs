//! Knowledge-distillation loss.

use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::ops::{log_softmax, softmax};

/// Cross-entropy of temperature-softened student predictions against the
/// teacher's softened distribution, averaged over the batch.
///
/// `student_logits` and `teacher_logits` are `[b, classes]`.
pub fn soft_target_loss(student_logits: &Tensor, teacher_logits: &Tensor, temperature: f64) -> Result<Tensor> {
    anyhow::ensure!(temperature > 0.0, "temperature must be positive, got {temperature}");
    let inv_t = 1.0 / temperature;
    let soft_targets = softmax(&teacher_logits.affine(inv_t, 0.0)?, D::Minus1)?;
    let student_log_probs = log_softmax(&student_logits.affine(inv_t, 0.0)?, D::Minus1)?;
    Ok((soft_targets * student_log_probs)?.sum(D::Minus1)?.mean_all()?.neg()?)
}

/// `alpha * T^2 * soft + (1 - alpha) * cross_entropy(student, labels)`.
///
/// The `T^2` factor keeps soft-target gradients on the same scale as the
/// hard-label term when the temperature changes.
pub fn distillation_loss(
    student_logits: &Tensor,
    teacher_logits: &Tensor,
    labels: &Tensor,
    temperature: f64,
    alpha: f64,
) -> Result<Tensor> {
    anyhow::ensure!((0.0..=1.0).contains(&alpha), "alpha must lie in [0, 1], got {alpha}");
    let soft = soft_target_loss(student_logits, teacher_logits, temperature)?;
    let hard = candle_nn::loss::cross_entropy(student_logits, labels)?;
    let total = (soft.affine(alpha * temperature * temperature, 0.0)? + hard.affine(1.0 - alpha, 0.0)?)?;
    Ok(total)
}
