//! Accuracy and per-class prediction statistics.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use distilmamba_core::SequenceModel;

use crate::classifier::{argmax_labels, SequenceClassifier};
use crate::dataset::DataLoader;
use crate::labels::Emotion;

/// How often each class was predicted.
///
/// A student that collapses onto the majority classes shows up here long
/// before it shows up in the accuracy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionDistribution {
    counts: Vec<usize>,
}

impl PredictionDistribution {
    pub fn new(num_labels: usize) -> Self {
        Self { counts: vec![0; num_labels] }
    }

    pub fn record(&mut self, label: u32) -> Result<()> {
        let slot = self
            .counts
            .get_mut(label as usize)
            .with_context(|| format!("predicted label {label} is out of range"))?;
        *slot += 1;
        Ok(())
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Share of predictions per class in percent; all zero when empty.
    pub fn percentages(&self) -> Vec<f64> {
        let total = self.total();
        if total == 0 {
            return vec![0.0; self.counts.len()];
        }
        self.counts.iter().map(|&c| c as f64 * 100.0 / total as f64).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub accuracy: f64,
    pub correct: usize,
    pub total: usize,
    pub distribution: PredictionDistribution,
}

impl EvalReport {
    /// Emit the report as structured log lines, one per class.
    pub fn log(&self, model: &str) {
        info!(
            model,
            accuracy = %format!("{:.4}", self.accuracy),
            correct = self.correct,
            total = self.total,
            "Evaluation"
        );
        for (i, (count, pct)) in self.distribution.counts().iter().zip(self.distribution.percentages()).enumerate() {
            let class = Emotion::from_index(i).map_or_else(|| i.to_string(), |e| e.to_string());
            info!(model, class = %class, count, percent = %format!("{pct:.1}"), "Prediction distribution");
        }
    }
}

/// Run the classifier in inference mode over every batch of `loader`.
///
/// The classifier's train/eval mode is restored afterwards. An empty
/// evaluation set is an error.
pub fn evaluate<M: SequenceModel>(classifier: &mut SequenceClassifier<M>, loader: &mut DataLoader) -> Result<EvalReport> {
    anyhow::ensure!(!loader.is_empty(), "evaluation set is empty");
    let was_training = classifier.is_training();
    classifier.eval();

    let mut distribution = PredictionDistribution::new(classifier.num_labels());
    let mut correct = 0usize;
    let mut total = 0usize;
    for batch in loader.epoch() {
        let batch = batch?;
        let out = classifier.forward(&batch.input_ids, Some(&batch.attention_mask), None)?;
        let predicted = argmax_labels(&out.logits.detach())?;
        let labels = batch.labels.to_vec1::<u32>()?;
        for (&p, &y) in predicted.iter().zip(labels.iter()) {
            distribution.record(p)?;
            correct += usize::from(p == y);
            total += 1;
        }
    }

    if was_training {
        classifier.train();
    }
    Ok(EvalReport { accuracy: correct as f64 / total as f64, correct, total, distribution })
}
