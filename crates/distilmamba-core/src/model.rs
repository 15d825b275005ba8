use candle_core::Tensor;

use crate::error::CoreResult;
use crate::param::Parameter;

/// A pretrained causal sequence model that produces per-token vocabulary
/// logits.
///
/// `parameters()` must return tensors in a stable, registration-defined
/// order: freezing policies select parameters by their position in this
/// list.
pub trait SequenceModel {
    /// Run the model over `input_ids` (`[batch, seq]`, `u32`).
    ///
    /// `attention_mask` is `[batch, seq]` with `1.0` for real tokens and
    /// `0.0` for padding. Returns logits of shape `[batch, seq, vocab]`.
    fn forward(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>) -> CoreResult<Tensor>;

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn hidden_size(&self) -> usize;

    fn vocab_size(&self) -> usize;

    fn layer_count(&self) -> usize;

    /// Total number of scalar weights.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.elem_count()).sum()
    }

    /// Number of scalar weights that currently receive gradients.
    fn num_trainable_parameters(&self) -> usize {
        self.parameters()
            .iter()
            .filter(|p| p.requires_grad())
            .map(|p| p.elem_count())
            .sum()
    }
}
