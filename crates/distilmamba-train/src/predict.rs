//! Single-text inference.

use anyhow::{Context, Result};
use candle_core::{Tensor, D};
use serde::Serialize;

use distilmamba_core::{SequenceModel, Tokenizer};

use crate::classifier::SequenceClassifier;
use crate::labels::Emotion;

/// Demonstration sentences used when `predict` is given no texts.
pub const DEFAULT_TEXTS: [&str; 6] = [
    "I feel happy today!",
    "This makes me so angry!",
    "I'm really sad about what happened.",
    "What an amazing surprise!",
    "I love you so much!",
    "This is terrifying!",
];

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub label: Emotion,
    /// Softmax over the classes, in label-index order.
    pub probabilities: Vec<f32>,
}

impl Prediction {
    pub fn confidence(&self) -> f32 {
        self.probabilities.get(self.label.index()).copied().unwrap_or(0.0)
    }
}

/// Classify one text. The sequence is not padded, so every position is real.
///
/// Switches the classifier to eval mode.
pub fn predict_text<M: SequenceModel>(
    classifier: &mut SequenceClassifier<M>,
    tokenizer: &Tokenizer,
    text: &str,
) -> Result<Prediction> {
    classifier.eval();
    let ids = tokenizer.encode(text).with_context(|| format!("Tokenisation failed for {text:?}"))?;
    anyhow::ensure!(!ids.is_empty(), "text {text:?} produced no tokens");

    let len = ids.len();
    let input_ids = Tensor::from_vec(ids, (1, len), classifier.device())?;
    let mask = Tensor::ones((1, len), candle_core::DType::F32, classifier.device())?;
    let logits = classifier.forward(&input_ids, Some(&mask), None)?.logits.detach();

    let probabilities = candle_nn::ops::softmax(&logits, D::Minus1)?.squeeze(0)?.to_vec1::<f32>()?;
    let (index, _) = probabilities
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .context("classifier produced no logits")?;
    let label = Emotion::from_index(index).with_context(|| format!("predicted class {index} has no emotion label"))?;
    Ok(Prediction { label, probabilities })
}
