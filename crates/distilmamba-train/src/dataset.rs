//! Emotion dataset loading and batching.
//!
//! A dataset directory holds one JSONL file per split (`train.jsonl`,
//! `test.jsonl`, optionally `validation.jsonl`). Each line is an object with
//! a `"text"` string and an integer `"label"` in `0..6`:
//!
//! ```json
//! {"text": "i feel like i am still looking at a blank canvas", "label": 0}
//! ```
//!
//! Texts are encoded once into fixed-length [`Example`]s; the [`DataLoader`]
//! stacks them into device tensors batch by batch.

use std::fs;
use std::io::{self, BufRead};
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::Deserialize;
use tracing::{debug, info};

use distilmamba_core::Tokenizer;

use crate::labels::NUM_LABELS;

/// Dataset split, mapped to `<split>.jsonl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub fn file_name(self) -> &'static str {
        match self {
            Split::Train => "train.jsonl",
            Split::Validation => "validation.jsonl",
            Split::Test => "test.jsonl",
        }
    }
}

/// One raw dataset row.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LabeledText {
    pub text: String,
    pub label: u32,
}

/// Read every row of `split` from `dir`.
pub fn load_split(dir: &Path, split: Split) -> Result<Vec<LabeledText>> {
    let path = dir.join(split.file_name());
    let file = fs::File::open(&path).with_context(|| format!("Cannot open dataset split {}", path.display()))?;

    let mut rows = Vec::new();
    for (line_no, line) in io::BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("IO error reading {}", path.display()))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let row: LabeledText = serde_json::from_str(trimmed).with_context(|| {
            format!(
                "JSON parse error at {}:{} — expected {{\"text\":…,\"label\":…}}",
                path.display(),
                line_no + 1
            )
        })?;
        anyhow::ensure!(
            (row.label as usize) < NUM_LABELS,
            "Label {} out of range 0..{} at {}:{}",
            row.label,
            NUM_LABELS,
            path.display(),
            line_no + 1
        );
        rows.push(row);
    }

    info!(path = %path.display(), count = rows.len(), "Loaded dataset split");
    Ok(rows)
}

/// Keep the first `len * percent / 100` rows, rounded half to even like a
/// `split[:N%]` slice.
pub fn take_percent(mut rows: Vec<LabeledText>, percent: f64) -> Vec<LabeledText> {
    let percent = percent.clamp(0.0, 100.0);
    let keep = ((rows.len() as f64) * percent / 100.0).round_ties_even() as usize;
    rows.truncate(keep);
    rows
}

/// A tokenised, fixed-length training example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub label: u32,
}

/// Examples that all share one sequence length.
#[derive(Debug, Clone)]
pub struct EncodedDataset {
    examples: Vec<Example>,
    max_length: usize,
}

impl EncodedDataset {
    /// Tokenise `rows`, truncating and right-padding to `max_length`.
    pub fn encode(rows: &[LabeledText], tokenizer: &Tokenizer, max_length: usize) -> Result<Self> {
        anyhow::ensure!(max_length > 0, "max_length must be positive");
        let examples = rows
            .iter()
            .map(|row| {
                let enc = tokenizer
                    .encode_padded(&row.text, max_length)
                    .with_context(|| format!("Tokenisation failed for {:?}", row.text))?;
                Ok(Example { input_ids: enc.token_ids, attention_mask: enc.attention_mask, label: row.label })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(count = examples.len(), max_length, "Encoded dataset");
        Ok(Self { examples, max_length })
    }

    pub fn from_examples(examples: Vec<Example>, max_length: usize) -> Result<Self> {
        anyhow::ensure!(
            examples.iter().all(|e| e.input_ids.len() == max_length && e.attention_mask.len() == max_length),
            "every example must have exactly {max_length} tokens"
        );
        Ok(Self { examples, max_length })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn as_slice(&self) -> &[Example] {
        &self.examples
    }
}

/// One batch of stacked tensors.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[b, L]`, `u32`.
    pub input_ids: Tensor,
    /// `[b, L]`, `f32`; `1.0` for real tokens.
    pub attention_mask: Tensor,
    /// `[b]`, `u32`.
    pub labels: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed-size batch iteration with optional seeded shuffling.
///
/// With shuffling enabled a fresh permutation is drawn at the start of every
/// epoch from one RNG seeded at construction, so runs are reproducible.
pub struct DataLoader {
    dataset: EncodedDataset,
    batch_size: usize,
    rng: Option<StdRng>,
    device: Device,
}

impl DataLoader {
    pub fn new(dataset: EncodedDataset, batch_size: usize, shuffle_seed: Option<u64>, device: &Device) -> Result<Self> {
        anyhow::ensure!(batch_size > 0, "batch_size must be positive");
        anyhow::ensure!(!dataset.is_empty(), "dataset split is empty");
        Ok(Self { dataset, batch_size, rng: shuffle_seed.map(StdRng::seed_from_u64), device: device.clone() })
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Batches per epoch; the last one may be smaller.
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &EncodedDataset {
        &self.dataset
    }

    /// Iterate one epoch of batches.
    pub fn epoch(&mut self) -> impl Iterator<Item = Result<Batch>> + '_ {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(rng) = self.rng.as_mut() {
            order.shuffle(rng);
        }
        let chunks: Vec<Vec<usize>> = order.chunks(self.batch_size).map(<[usize]>::to_vec).collect();
        let this = &*self;
        chunks.into_iter().map(move |indices| this.make_batch(&indices))
    }

    fn make_batch(&self, indices: &[usize]) -> Result<Batch> {
        let examples = self.dataset.as_slice();
        let (b, len) = (indices.len(), self.dataset.max_length());

        let mut ids = Vec::with_capacity(b * len);
        let mut mask = Vec::with_capacity(b * len);
        let mut labels = Vec::with_capacity(b);
        for &i in indices {
            let ex = &examples[i];
            ids.extend_from_slice(&ex.input_ids);
            mask.extend(ex.attention_mask.iter().map(|&m| m as f32));
            labels.push(ex.label);
        }

        Ok(Batch {
            input_ids: Tensor::from_vec(ids, (b, len), &self.device).context("Failed to build input_ids tensor")?,
            attention_mask: Tensor::from_vec(mask, (b, len), &self.device)
                .context("Failed to build attention_mask tensor")?,
            labels: Tensor::from_vec(labels, b, &self.device).context("Failed to build labels tensor")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn make_split(lines: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        let mut f = fs::File::create(dir.path().join("train.jsonl")).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        dir
    }

    fn rows(n: usize) -> Vec<LabeledText> {
        (0..n).map(|i| LabeledText { text: format!("t{i}"), label: (i % NUM_LABELS) as u32 }).collect()
    }

    fn dataset(n: usize, len: usize) -> EncodedDataset {
        let examples = (0..n)
            .map(|i| Example {
                input_ids: vec![i as u32; len],
                attention_mask: vec![1; len],
                label: (i % NUM_LABELS) as u32,
            })
            .collect();
        EncodedDataset::from_examples(examples, len).unwrap()
    }

    #[test]
    fn loads_jsonl_and_skips_blank_lines() {
        let dir = make_split(&[r#"{"text":"i feel happy","label":1}"#, "", r#"{"text":"so sad","label":0}"#]);
        let rows = load_split(dir.path(), Split::Train).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], LabeledText { text: "i feel happy".into(), label: 1 });
    }

    #[test]
    fn out_of_range_label_names_the_line() {
        let dir = make_split(&[r#"{"text":"a","label":1}"#, r#"{"text":"b","label":6}"#]);
        let err = load_split(dir.path(), Split::Train).unwrap_err();
        assert!(err.to_string().contains("train.jsonl:2"), "{err}");
    }

    #[test]
    fn malformed_line_errors() {
        let dir = make_split(&[r#"{"text":"a"}"#]);
        assert!(load_split(dir.path(), Split::Train).is_err());
    }

    #[test]
    fn missing_split_errors() {
        let dir = make_split(&[]);
        assert!(load_split(dir.path(), Split::Test).is_err());
    }

    #[test]
    fn percent_subset_rounds_to_nearest() {
        assert_eq!(take_percent(rows(16000), 1.0).len(), 160);
        assert_eq!(take_percent(rows(2000), 1.0).len(), 20);
        assert_eq!(take_percent(rows(150), 1.0).len(), 2);
        assert_eq!(take_percent(rows(10), 100.0).len(), 10);
        assert_eq!(take_percent(rows(10), 250.0).len(), 10);
        assert!(take_percent(rows(10), 1.0).is_empty());
        assert_eq!(take_percent(rows(10), 50.0)[0].text, "t0");
    }

    #[test]
    fn subset_boundaries_round_half_to_even() {
        assert!(take_percent(rows(50), 1.0).is_empty());
        assert_eq!(take_percent(rows(250), 1.0).len(), 2);
        assert_eq!(take_percent(rows(350), 1.0).len(), 4);
        assert_eq!(take_percent(rows(351), 1.0).len(), 4);
    }

    #[test]
    fn batches_cover_dataset_with_short_tail() {
        let mut loader = DataLoader::new(dataset(5, 3), 2, None, &Device::Cpu).unwrap();
        assert_eq!(loader.num_batches(), 3);
        let batches: Vec<Batch> = loader.epoch().collect::<Result<_>>().unwrap();
        assert_eq!(batches.iter().map(Batch::len).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(batches[0].input_ids.dims(), &[2, 3]);
        assert_eq!(batches[0].attention_mask.dtype(), candle_core::DType::F32);
        assert_eq!(batches[2].labels.to_vec1::<u32>().unwrap(), vec![4]);
    }

    #[test]
    fn unshuffled_order_is_stable() {
        let mut loader = DataLoader::new(dataset(4, 2), 4, None, &Device::Cpu).unwrap();
        let first = loader.epoch().next().unwrap().unwrap().labels.to_vec1::<u32>().unwrap();
        assert_eq!(first, vec![0, 1, 2, 3]);
    }

    #[test]
    fn shuffling_is_seeded_and_redrawn_per_epoch() {
        let labels_of = |loader: &mut DataLoader| -> Vec<u32> {
            loader
                .epoch()
                .flat_map(|b| b.unwrap().input_ids.to_vec2::<u32>().unwrap().into_iter().map(|r| r[0]))
                .collect()
        };
        let mut a = DataLoader::new(dataset(32, 1), 8, Some(7), &Device::Cpu).unwrap();
        let mut b = DataLoader::new(dataset(32, 1), 8, Some(7), &Device::Cpu).unwrap();
        let a1 = labels_of(&mut a);
        let a2 = labels_of(&mut a);
        assert_eq!(a1, labels_of(&mut b));
        assert_ne!(a1, a2);

        let mut sorted = a1.clone();
        sorted.sort();
        assert_eq!(sorted, (0..32).collect::<Vec<u32>>());
    }

    #[test]
    fn empty_dataset_is_rejected() {
        assert!(DataLoader::new(dataset(0, 2), 8, None, &Device::Cpu).is_err());
    }
}
