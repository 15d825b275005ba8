//! Sequence classifier built on a pretrained causal sequence model.
//!
//! The base model's per-token vocabulary logits are pooled over the
//! sequence, projected from vocabulary width to hidden width and fed to a
//! two-layer head:
//!
//! ```text
//! base logits [b, L, V] ─pool→ [b, V] ─projection→ [b, H]
//!     ─Linear→ [b, H/2] ─GELU→ Dropout(0.1) ─Linear→ [b, num_labels]
//! ```
//!
//! Every tensor lives in one `VarMap` owned by the classifier, under the keys
//! `mamba.*`, `projection.*`, `classifier.0.*` and `classifier.3.*`, so a
//! checkpoint is a single safetensors file.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::{Dropout, Init, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::info;

use distilmamba_core::{weights, CoreResult, Mamba, MambaConfig, Parameter, SequenceModel};

use crate::freeze::FreezePolicy;

/// Key prefix of the base model inside the classifier's variable map.
pub const BASE_PREFIX: &str = "mamba";

const HEAD_DROPOUT: f32 = 0.1;
const MEAN_POOL_MIN_COUNT: f64 = 1e-9;
const MAX_POOL_MASK_VALUE: f64 = 1e9;

/// How per-token outputs are reduced over the sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolingMode {
    #[default]
    Mean,
    Max,
}

impl std::str::FromStr for PoolingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mean" => Ok(PoolingMode::Mean),
            "max" => Ok(PoolingMode::Max),
            other => anyhow::bail!("unknown pooling mode '{other}' (expected 'mean' or 'max')"),
        }
    }
}

/// Pool `[b, L, V]` to `[b, V]`.
///
/// With a `[b, L]` mask, mean pooling averages only unmasked positions (the
/// count is clamped away from zero) and max pooling pushes masked positions
/// to `-1e9` first. Without a mask both reduce over the whole sequence.
pub fn pool(hidden: &Tensor, mask: Option<&Tensor>, mode: PoolingMode) -> CoreResult<Tensor> {
    let out = match (mode, mask) {
        (PoolingMode::Mean, Some(mask)) => {
            let m = mask.to_dtype(hidden.dtype())?.unsqueeze(2)?;
            let summed = hidden.broadcast_mul(&m)?.sum(1)?;
            let count = m.sum(1)?.maximum(MEAN_POOL_MIN_COUNT)?;
            summed.broadcast_div(&count)?
        }
        (PoolingMode::Mean, None) => hidden.mean(1)?,
        (PoolingMode::Max, Some(mask)) => {
            let m = mask.to_dtype(hidden.dtype())?.unsqueeze(2)?;
            let penalty = (m.affine(-1.0, 1.0)? * MAX_POOL_MASK_VALUE)?;
            hidden.broadcast_mul(&m)?.broadcast_sub(&penalty)?.max(1)?
        }
        (PoolingMode::Max, None) => hidden.max(1)?,
    };
    Ok(out)
}

/// Result of one classifier forward pass.
#[derive(Debug, Clone)]
pub struct ClassifierOutput {
    /// Mean cross-entropy, present when labels were supplied.
    pub loss: Option<Tensor>,
    /// `[b, num_labels]`.
    pub logits: Tensor,
}

#[derive(Debug)]
struct DenseLayer {
    weight: Parameter,
    bias: Parameter,
}

impl DenseLayer {
    /// PyTorch `nn.Linear` default init: `U(-1/sqrt(in), 1/sqrt(in))`.
    fn new(vb: VarBuilder, prefix: &str, in_dim: usize, out_dim: usize) -> Result<Self> {
        let bound = 1.0 / (in_dim as f64).sqrt();
        let init = Init::Uniform { lo: -bound, up: bound };
        let weight = vb.get_with_hints((out_dim, in_dim), "weight", init)?;
        let bias = vb.get_with_hints(out_dim, "bias", init)?;
        Ok(Self {
            weight: Parameter::new(format!("{prefix}.weight"), &weight)?,
            bias: Parameter::new(format!("{prefix}.bias"), &bias)?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(Linear::new(self.weight.tensor(), Some(self.bias.tensor())).forward(xs)?)
    }

    fn vars(&self) -> [Var; 2] {
        [self.weight.var().clone(), self.bias.var().clone()]
    }
}

/// A base sequence model with a pooling classification head.
pub struct SequenceClassifier<M: SequenceModel = Mamba> {
    base: M,
    projection: DenseLayer,
    hidden_layer: DenseLayer,
    output_layer: DenseLayer,
    dropout: Dropout,
    pooling: PoolingMode,
    num_labels: usize,
    training: bool,
    varmap: VarMap,
    device: Device,
}

// `VarMap` does not implement `Debug`, so this cannot be derived.
impl<M: SequenceModel + std::fmt::Debug> std::fmt::Debug for SequenceClassifier<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceClassifier")
            .field("base", &self.base)
            .field("projection", &self.projection)
            .field("hidden_layer", &self.hidden_layer)
            .field("output_layer", &self.output_layer)
            .field("dropout", &self.dropout)
            .field("pooling", &self.pooling)
            .field("num_labels", &self.num_labels)
            .field("training", &self.training)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl SequenceClassifier<Mamba> {
    /// Freshly initialised Mamba classifier. Load pretrained or checkpointed
    /// weights afterwards.
    pub fn mamba(
        config: &MambaConfig,
        num_labels: usize,
        pooling: PoolingMode,
        policy: FreezePolicy,
        device: &Device,
    ) -> Result<Self> {
        Self::new(num_labels, pooling, policy, device, |vb| Mamba::new(config, vb))
            .context("Failed to construct Mamba classifier")
    }
}

impl<M: SequenceModel> SequenceClassifier<M> {
    /// Build the base model under `mamba.*` with `build_base`, apply the
    /// freeze policy to its parameters and add the head.
    pub fn new(
        num_labels: usize,
        pooling: PoolingMode,
        policy: FreezePolicy,
        device: &Device,
        build_base: impl FnOnce(VarBuilder) -> CoreResult<M>,
    ) -> Result<Self> {
        anyhow::ensure!(num_labels > 0, "num_labels must be positive");
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let mut base = build_base(vb.pp(BASE_PREFIX))?;
        let frozen = policy.apply(base.parameters_mut());

        let hidden = base.hidden_size();
        let vocab = base.vocab_size();
        anyhow::ensure!(hidden >= 2, "hidden size {hidden} is too small for the classification head");

        let projection = DenseLayer::new(vb.pp("projection"), "projection", vocab, hidden)?;
        let hidden_layer = DenseLayer::new(vb.pp("classifier.0"), "classifier.0", hidden, hidden / 2)?;
        let output_layer = DenseLayer::new(vb.pp("classifier.3"), "classifier.3", hidden / 2, num_labels)?;

        info!(
            hidden_size = hidden,
            vocab_size = vocab,
            layers = base.layer_count(),
            base_tensors = base.parameters().len(),
            frozen_tensors = frozen,
            trainable_base_params = base.num_trainable_parameters(),
            "Classifier initialised"
        );

        Ok(Self {
            base,
            projection,
            hidden_layer,
            output_layer,
            dropout: Dropout::new(HEAD_DROPOUT),
            pooling,
            num_labels,
            training: true,
            varmap,
            device: device.clone(),
        })
    }

    /// Enable dropout.
    pub fn train(&mut self) {
        self.training = true;
    }

    /// Disable dropout.
    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        labels: Option<&Tensor>,
    ) -> Result<ClassifierOutput> {
        let hidden = self
            .base
            .forward(input_ids, attention_mask)
            .context("Base model forward pass failed")?;
        let pooled = pool(&hidden, attention_mask, self.pooling)?;
        let projected = self.projection.forward(&pooled)?;

        let xs = self.hidden_layer.forward(&projected)?.gelu_erf()?;
        let xs = self.dropout.forward(&xs, self.training)?;
        let logits = self.output_layer.forward(&xs)?;

        let loss = match labels {
            Some(labels) => Some(candle_nn::loss::cross_entropy(&logits, labels)?),
            None => None,
        };
        Ok(ClassifierOutput { loss, logits })
    }

    pub fn base(&self) -> &M {
        &self.base
    }

    pub fn hidden_size(&self) -> usize {
        self.base.hidden_size()
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn pooling(&self) -> PoolingMode {
        self.pooling
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Projection and classification-head variables.
    pub fn head_vars(&self) -> Vec<Var> {
        [&self.projection, &self.hidden_layer, &self.output_layer]
            .iter()
            .flat_map(|l| l.vars())
            .collect()
    }

    /// Base-model variables left trainable by the freeze policy.
    pub fn trainable_base_vars(&self) -> Vec<Var> {
        self.base
            .parameters()
            .into_iter()
            .filter(|p| p.requires_grad())
            .map(|p| p.var().clone())
            .collect()
    }

    /// Every variable that receives gradients.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.head_vars();
        vars.extend(self.trainable_base_vars());
        vars
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Copy pretrained base weights from a Hugging Face model directory.
    pub fn load_pretrained(&self, model_dir: &Path) -> Result<usize> {
        let paths = weights::collect_safetensor_paths(model_dir)?;
        let loaded = weights::load_pretrained(&self.varmap, &format!("{BASE_PREFIX}."), &paths)
            .with_context(|| format!("Failed to load pretrained weights from {}", model_dir.display()))?;
        Ok(loaded)
    }

    /// Write the full classifier state.
    pub fn save(&self, path: &Path) -> Result<()> {
        weights::save_checkpoint(&self.varmap, path)
            .with_context(|| format!("Failed to save checkpoint to {}", path.display()))
    }

    /// Restore a checkpoint written by [`save`](Self::save); keys must match exactly.
    pub fn load(&self, path: &Path) -> Result<()> {
        weights::load_checkpoint(&self.varmap, path)
            .with_context(|| format!("Failed to load checkpoint {}", path.display()))
    }
}

/// Class index with the highest logit per row.
pub fn argmax_labels(logits: &Tensor) -> Result<Vec<u32>> {
    Ok(logits.argmax(D::Minus1)?.to_vec1::<u32>()?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn tiny_config() -> MambaConfig {
        MambaConfig {
            hidden_size: 8,
            num_hidden_layers: 2,
            vocab_size: 12,
            state_size: 4,
            expand: 2,
            conv_kernel: 3,
            time_step_rank: None,
            intermediate_size: None,
            use_bias: false,
            use_conv_bias: true,
            layer_norm_epsilon: 1e-5,
            tie_word_embeddings: true,
            pad_token_id: Some(0),
            eos_token_id: Some(0),
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn mean_pool_ignores_padding_values() {
        let dev = Device::Cpu;
        let mask = Tensor::new(&[[1f32, 1., 0.], [1., 0., 0.]], &dev).unwrap();
        let a = Tensor::new(&[[[1f32, 2.], [3., 4.], [100., -100.]], [[5., 6.], [7., 8.], [9., 10.]]], &dev).unwrap();
        let b = Tensor::new(&[[[1f32, 2.], [3., 4.], [-7., 0.5]], [[5., 6.], [-1., 1e4], [0., 0.]]], &dev).unwrap();

        let pa = pool(&a, Some(&mask), PoolingMode::Mean).unwrap();
        let pb = pool(&b, Some(&mask), PoolingMode::Mean).unwrap();
        assert_eq!(pa.to_vec2::<f32>().unwrap(), vec![vec![2., 3.], vec![5., 6.]]);
        assert!(max_abs_diff(&pa, &pb) < 1e-6);
    }

    #[test]
    fn mean_pool_with_empty_mask_is_finite() {
        let dev = Device::Cpu;
        let mask = Tensor::zeros((1, 2), DType::F32, &dev).unwrap();
        let h = Tensor::new(&[[[1f32], [2.]]], &dev).unwrap();
        let p = pool(&h, Some(&mask), PoolingMode::Mean).unwrap();
        assert_eq!(p.to_vec2::<f32>().unwrap(), vec![vec![0.]]);
    }

    #[test]
    fn max_pool_skips_masked_positions() {
        let dev = Device::Cpu;
        let mask = Tensor::new(&[[1f32, 1., 0.]], &dev).unwrap();
        let h = Tensor::new(&[[[-3f32, 1.], [-2., 0.], [50., 50.]]], &dev).unwrap();
        let p = pool(&h, Some(&mask), PoolingMode::Max).unwrap();
        assert_eq!(p.to_vec2::<f32>().unwrap(), vec![vec![-2., 1.]]);
    }

    #[test]
    fn pooling_without_mask_covers_whole_sequence() {
        let dev = Device::Cpu;
        let h = Tensor::new(&[[[1f32], [3.], [8.]]], &dev).unwrap();
        assert_eq!(pool(&h, None, PoolingMode::Mean).unwrap().to_vec2::<f32>().unwrap(), vec![vec![4.]]);
        assert_eq!(pool(&h, None, PoolingMode::Max).unwrap().to_vec2::<f32>().unwrap(), vec![vec![8.]]);
    }

    #[test]
    fn construction_freezes_all_but_last_two_base_tensors() {
        let clf = SequenceClassifier::mamba(&tiny_config(), 6, PoolingMode::Mean, FreezePolicy::default(), &Device::Cpu)
            .unwrap();
        let params = clf.base().parameters();
        let p = params.len();
        assert!(params[..p - 2].iter().all(|x| !x.requires_grad()));
        assert!(params[p - 2..].iter().all(|x| x.requires_grad()));
        assert_eq!(clf.trainable_base_vars().len(), 2);
        assert_eq!(clf.head_vars().len(), 6);
        assert_eq!(clf.trainable_vars().len(), 8);
    }

    #[test]
    fn varmap_keys_use_classifier_layout() {
        let clf = SequenceClassifier::mamba(&tiny_config(), 6, PoolingMode::Mean, FreezePolicy::default(), &Device::Cpu)
            .unwrap();
        let data = clf.varmap().data().lock().unwrap();
        for key in [
            "mamba.backbone.embeddings.weight",
            "mamba.backbone.norm_f.weight",
            "projection.weight",
            "classifier.0.bias",
            "classifier.3.weight",
        ] {
            assert!(data.contains_key(key), "missing {key}");
        }
        assert_eq!(data["projection.weight"].dims(), &[8, 12]);
        assert_eq!(data["classifier.3.weight"].dims(), &[6, 4]);
    }

    #[test]
    fn forward_shapes_and_optional_loss() {
        let mut clf =
            SequenceClassifier::mamba(&tiny_config(), 6, PoolingMode::Max, FreezePolicy::default(), &Device::Cpu).unwrap();
        clf.eval();
        let ids = Tensor::new(&[[1u32, 2, 3, 0], [4, 5, 0, 0]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1f32, 1., 1., 0.], [1., 1., 0., 0.]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[2u32, 5], &Device::Cpu).unwrap();

        let out = clf.forward(&ids, Some(&mask), None).unwrap();
        assert_eq!(out.logits.dims(), &[2, 6]);
        assert!(out.loss.is_none());

        let out = clf.forward(&ids, Some(&mask), Some(&labels)).unwrap();
        let loss = out.loss.unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn classifier_logits_ignore_padded_token_ids() {
        let mut clf =
            SequenceClassifier::mamba(&tiny_config(), 6, PoolingMode::Mean, FreezePolicy::default(), &Device::Cpu).unwrap();
        clf.eval();
        let mask = Tensor::new(&[[1f32, 1., 0., 0.]], &Device::Cpu).unwrap();
        let a = Tensor::new(&[[3u32, 4, 0, 0]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[3u32, 4, 9, 11]], &Device::Cpu).unwrap();
        let la = clf.forward(&a, Some(&mask), None).unwrap().logits;
        let lb = clf.forward(&b, Some(&mask), None).unwrap().logits;
        assert!(max_abs_diff(&la, &lb) < 1e-5);
    }

    #[test]
    fn eval_mode_is_deterministic() {
        let mut clf =
            SequenceClassifier::mamba(&tiny_config(), 6, PoolingMode::Mean, FreezePolicy::default(), &Device::Cpu).unwrap();
        clf.eval();
        let ids = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        let a = clf.forward(&ids, None, None).unwrap().logits;
        let b = clf.forward(&ids, None, None).unwrap().logits;
        assert_eq!(max_abs_diff(&a, &b), 0.0);
    }

    #[test]
    fn pooling_mode_parses() {
        assert_eq!("MEAN".parse::<PoolingMode>().unwrap(), PoolingMode::Mean);
        assert_eq!("max".parse::<PoolingMode>().unwrap(), PoolingMode::Max);
        assert!("sum".parse::<PoolingMode>().is_err());
    }
}
