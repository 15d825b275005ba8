//! Which base-model tensors receive gradients.

use serde::{Deserialize, Serialize};
use tracing::debug;

use distilmamba_core::Parameter;

/// Partial fine-tuning policy over a base model's ordered parameter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "count", rename_all = "snake_case")]
pub enum FreezePolicy {
    /// Everything stays trainable.
    None,
    /// Freeze every tensor except the last `n` in registration order.
    ///
    /// This selects by list position, not by layer. For a tied-head Mamba
    /// `TrainLastTensors(2)` leaves the last block's `out_proj.weight` and
    /// the final norm trainable.
    TrainLastTensors(usize),
}

impl Default for FreezePolicy {
    fn default() -> Self {
        FreezePolicy::TrainLastTensors(2)
    }
}

impl FreezePolicy {
    /// Whether the tensor at `index` of `total` stays trainable.
    pub fn is_trainable(&self, index: usize, total: usize) -> bool {
        match *self {
            FreezePolicy::None => true,
            FreezePolicy::TrainLastTensors(n) => index + n >= total,
        }
    }

    /// Set `requires_grad` on every parameter; returns how many were frozen.
    pub fn apply(&self, params: Vec<&mut Parameter>) -> usize {
        let total = params.len();
        let mut frozen = 0;
        for (i, p) in params.into_iter().enumerate() {
            let trainable = self.is_trainable(i, total);
            p.set_requires_grad(trainable);
            if !trainable {
                frozen += 1;
            }
        }
        debug!(policy = ?self, total, frozen, "Applied freeze policy");
        frozen
    }
}
