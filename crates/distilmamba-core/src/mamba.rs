//! Mamba selective state-space language model.
//!
//! Parameter names and registration order follow the Hugging Face
//! `MambaForCausalLM` checkpoints (`backbone.embeddings.weight`,
//! `backbone.layers.{i}.mixer.*`, `backbone.norm_f.weight`), so pretrained
//! `state-spaces/mamba-*-hf` safetensors load by name without remapping.
//!
//! The forward pass is the full-sequence ("slow path") formulation: every
//! mixer runs its causal depthwise convolution and selective scan over the
//! whole batch, which is what training needs. There is no recurrent
//! inference cache.

use std::path::Path;

use candle_core::{DType, IndexOp, Module, Tensor, D};
use candle_nn::{init, Embedding, Init, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::{CoreError, CoreResult},
    model::SequenceModel,
    param::Parameter,
};

const DT_MIN: f64 = 1e-3;
const DT_MAX: f64 = 1e-1;
const DT_FLOOR: f64 = 1e-4;
const EMBEDDING_STD: f64 = 0.02;

fn default_state_size() -> usize {
    16
}
fn default_expand() -> usize {
    2
}
fn default_conv_kernel() -> usize {
    4
}
fn default_use_conv_bias() -> bool {
    true
}
fn default_eps() -> f64 {
    1e-5
}
fn default_tie() -> bool {
    true
}

/// Hugging Face `config.json` for a Mamba checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MambaConfig {
    #[serde(alias = "d_model")]
    pub hidden_size: usize,
    #[serde(alias = "n_layer")]
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_state_size", alias = "d_state")]
    pub state_size: usize,
    #[serde(default = "default_expand")]
    pub expand: usize,
    #[serde(default = "default_conv_kernel", alias = "d_conv")]
    pub conv_kernel: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_step_rank: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_size: Option<usize>,
    #[serde(default)]
    pub use_bias: bool,
    #[serde(default = "default_use_conv_bias")]
    pub use_conv_bias: bool,
    #[serde(default = "default_eps")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_tie")]
    pub tie_word_embeddings: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pad_token_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos_token_id: Option<u32>,
}

impl MambaConfig {
    /// Read and validate `config.json`.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> CoreResult<()> {
        let checks = [
            ("hidden_size", self.hidden_size),
            ("num_hidden_layers", self.num_hidden_layers),
            ("vocab_size", self.vocab_size),
            ("state_size", self.state_size),
            ("expand", self.expand),
            ("conv_kernel", self.conv_kernel),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(CoreError::Config {
                    field: field.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Width of the inner (expanded) mixer channels.
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size.unwrap_or(self.expand * self.hidden_size)
    }

    /// Rank of the time-step projection.
    pub fn dt_rank(&self) -> usize {
        self.time_step_rank.unwrap_or_else(|| self.hidden_size.div_ceil(16))
    }

    /// Student shape: half the hidden size, a quarter of the layers (at
    /// least one). The derived widths are recomputed from the new hidden
    /// size rather than copied from the teacher.
    pub fn shrunk_for_student(&self) -> Self {
        Self {
            hidden_size: (self.hidden_size / 2).max(1),
            num_hidden_layers: (self.num_hidden_layers / 4).max(1),
            time_step_rank: None,
            intermediate_size: None,
            ..self.clone()
        }
    }
}

fn param(vb: &VarBuilder, shape: impl Into<candle_core::Shape>, name: &str, hint: Init) -> CoreResult<Parameter> {
    let tensor = vb.get_with_hints(shape, name, hint)?;
    let full_name = if vb.prefix().is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", vb.prefix(), name)
    };
    Parameter::new(full_name, &tensor)
}

fn linear(weight: &Parameter, bias: Option<&Parameter>) -> Linear {
    Linear::new(weight.tensor(), bias.map(Parameter::tensor))
}

fn rms_norm(xs: &Tensor, weight: &Parameter, eps: f64) -> CoreResult<Tensor> {
    let variance = xs.sqr()?.mean_keepdim(D::Minus1)?;
    let normed = xs.broadcast_div(&(variance + eps)?.sqrt()?)?;
    Ok(normed.broadcast_mul(&weight.tensor())?)
}

/// `log(1 + exp(x))` without overflow for large `x`.
fn softplus(xs: &Tensor) -> CoreResult<Tensor> {
    let pos = xs.relu()?;
    let neg_abs = (xs - (&pos * 2.0)?)?;
    Ok((pos + neg_abs.exp()?.affine(1.0, 1.0)?.log()?)?)
}

#[derive(Debug)]
struct MambaMixer {
    a_log: Parameter,
    d: Parameter,
    conv_weight: Parameter,
    conv_bias: Option<Parameter>,
    in_proj_weight: Parameter,
    in_proj_bias: Option<Parameter>,
    x_proj_weight: Parameter,
    dt_proj_weight: Parameter,
    dt_proj_bias: Parameter,
    out_proj_weight: Parameter,
    out_proj_bias: Option<Parameter>,
    intermediate: usize,
    state_size: usize,
    dt_rank: usize,
    conv_kernel: usize,
}

impl MambaMixer {
    fn new(cfg: &MambaConfig, vb: VarBuilder) -> CoreResult<Self> {
        let hidden = cfg.hidden_size;
        let inner = cfg.intermediate_size();
        let n = cfg.state_size;
        let rank = cfg.dt_rank();
        let k = cfg.conv_kernel;
        let device = vb.device().clone();

        let a_log = param(&vb, (inner, n), "A_log", Init::Const(0.0))?;
        let a_init = Tensor::arange(1u32, n as u32 + 1, &device)?
            .to_dtype(DType::F32)?
            .log()?
            .unsqueeze(0)?
            .broadcast_as((inner, n))?
            .contiguous()?
            .to_dtype(vb.dtype())?;
        a_log.var().set(&a_init)?;

        let d = param(&vb, inner, "D", Init::Const(1.0))?;

        let conv_bound = 1.0 / (k as f64).sqrt();
        let conv_init = Init::Uniform { lo: -conv_bound, up: conv_bound };
        let conv_vb = vb.pp("conv1d");
        let conv_weight = param(&conv_vb, (inner, 1, k), "weight", conv_init)?;
        let conv_bias = if cfg.use_conv_bias {
            Some(param(&conv_vb, inner, "bias", conv_init)?)
        } else {
            None
        };

        let in_vb = vb.pp("in_proj");
        let in_proj_weight = param(&in_vb, (inner * 2, hidden), "weight", init::DEFAULT_KAIMING_NORMAL)?;
        let in_proj_bias = if cfg.use_bias {
            Some(param(&in_vb, inner * 2, "bias", Init::Const(0.0))?)
        } else {
            None
        };

        let x_proj_weight = param(&vb.pp("x_proj"), (rank + 2 * n, inner), "weight", init::DEFAULT_KAIMING_NORMAL)?;

        let dt_vb = vb.pp("dt_proj");
        let dt_std = (rank as f64).powf(-0.5);
        let dt_proj_weight = param(&dt_vb, (inner, rank), "weight", Init::Uniform { lo: -dt_std, up: dt_std })?;
        let dt_proj_bias = param(&dt_vb, inner, "bias", Init::Const(0.0))?;
        // Inverse softplus of a log-uniform time step in [DT_MIN, DT_MAX].
        let (lo, hi) = (DT_MIN.ln(), DT_MAX.ln());
        let dt = Tensor::rand(0f32, 1f32, inner, &device)?
            .affine(hi - lo, lo)?
            .exp()?
            .maximum(DT_FLOOR)?;
        let inv_dt = (&dt + dt.neg()?.exp()?.affine(-1.0, 1.0)?.log()?)?;
        dt_proj_bias.var().set(&inv_dt.to_dtype(vb.dtype())?)?;

        let out_vb = vb.pp("out_proj");
        let out_proj_weight = param(&out_vb, (hidden, inner), "weight", init::DEFAULT_KAIMING_NORMAL)?;
        let out_proj_bias = if cfg.use_bias {
            Some(param(&out_vb, hidden, "bias", Init::Const(0.0))?)
        } else {
            None
        };

        Ok(Self {
            a_log,
            d,
            conv_weight,
            conv_bias,
            in_proj_weight,
            in_proj_bias,
            x_proj_weight,
            dt_proj_weight,
            dt_proj_bias,
            out_proj_weight,
            out_proj_bias,
            intermediate: inner,
            state_size: n,
            dt_rank: rank,
            conv_kernel: k,
        })
    }

    /// Causal depthwise convolution over `[b, L, inner]`.
    fn causal_conv(&self, xs: &Tensor) -> CoreResult<Tensor> {
        let (b, len, inner) = xs.dims3()?;
        let k = self.conv_kernel;
        let weight = self.conv_weight.tensor().squeeze(1)?;
        let padded = if k > 1 {
            let pad = Tensor::zeros((b, k - 1, inner), xs.dtype(), xs.device())?;
            Tensor::cat(&[&pad, xs], 1)?
        } else {
            xs.clone()
        };
        let mut out = padded.narrow(1, 0, len)?.broadcast_mul(&weight.i((.., 0))?)?;
        for j in 1..k {
            let tap = padded.narrow(1, j, len)?.broadcast_mul(&weight.i((.., j))?)?;
            out = (out + tap)?;
        }
        if let Some(bias) = &self.conv_bias {
            out = out.broadcast_add(&bias.tensor())?;
        }
        Ok(out)
    }

    fn forward(&self, hidden: &Tensor, mask: Option<&Tensor>) -> CoreResult<Tensor> {
        let (b, len, _) = hidden.dims3()?;
        let projected = linear(&self.in_proj_weight, self.in_proj_bias.as_ref()).forward(hidden)?;
        let xs = projected.narrow(D::Minus1, 0, self.intermediate)?.contiguous()?;
        let gate = projected.narrow(D::Minus1, self.intermediate, self.intermediate)?.contiguous()?;

        let mut xs = match mask {
            Some(m) => xs.broadcast_mul(m)?,
            None => xs,
        };
        xs = candle_nn::ops::silu(&self.causal_conv(&xs)?)?;
        if let Some(m) = mask {
            xs = xs.broadcast_mul(m)?;
        }

        let ssm = Linear::new(self.x_proj_weight.tensor(), None).forward(&xs)?;
        let n = self.state_size;
        let time_step = ssm.narrow(D::Minus1, 0, self.dt_rank)?.contiguous()?;
        let b_mat = ssm.narrow(D::Minus1, self.dt_rank, n)?.contiguous()?;
        let c_mat = ssm.narrow(D::Minus1, self.dt_rank + n, n)?.contiguous()?;

        let dt = softplus(&linear(&self.dt_proj_weight, Some(&self.dt_proj_bias)).forward(&time_step)?)?;
        let a = self.a_log.tensor().exp()?.neg()?;

        // [b, L, inner, N]
        let d_a = dt.unsqueeze(3)?.broadcast_mul(&a)?.exp()?;
        let d_bu = (&dt * &xs)?.unsqueeze(3)?.broadcast_mul(&b_mat.unsqueeze(2)?)?;

        let mut state = Tensor::zeros((b, self.intermediate, n), xs.dtype(), xs.device())?;
        let mut ys = Vec::with_capacity(len);
        for t in 0..len {
            state = ((d_a.i((.., t))? * &state)? + d_bu.i((.., t))?)?;
            let c_t = c_mat.i((.., t))?.unsqueeze(1)?;
            ys.push(state.broadcast_mul(&c_t)?.sum(D::Minus1)?);
        }
        let y = Tensor::stack(&ys, 1)?;
        let y = (y + xs.broadcast_mul(&self.d.tensor())?)?;
        let y = (y * candle_nn::ops::silu(&gate)?)?;

        Ok(linear(&self.out_proj_weight, self.out_proj_bias.as_ref()).forward(&y)?)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut out = vec![&self.a_log, &self.d, &self.conv_weight];
        out.extend(self.conv_bias.as_ref());
        out.push(&self.in_proj_weight);
        out.extend(self.in_proj_bias.as_ref());
        out.extend([&self.x_proj_weight, &self.dt_proj_weight, &self.dt_proj_bias, &self.out_proj_weight]);
        out.extend(self.out_proj_bias.as_ref());
        out
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut out = vec![&mut self.a_log, &mut self.d, &mut self.conv_weight];
        out.extend(self.conv_bias.as_mut());
        out.push(&mut self.in_proj_weight);
        out.extend(self.in_proj_bias.as_mut());
        out.extend([
            &mut self.x_proj_weight,
            &mut self.dt_proj_weight,
            &mut self.dt_proj_bias,
            &mut self.out_proj_weight,
        ]);
        out.extend(self.out_proj_bias.as_mut());
        out
    }
}

#[derive(Debug)]
struct MambaBlock {
    norm: Parameter,
    mixer: MambaMixer,
    eps: f64,
}

impl MambaBlock {
    fn new(cfg: &MambaConfig, vb: VarBuilder) -> CoreResult<Self> {
        Ok(Self {
            norm: param(&vb.pp("norm"), cfg.hidden_size, "weight", Init::Const(1.0))?,
            mixer: MambaMixer::new(cfg, vb.pp("mixer"))?,
            eps: cfg.layer_norm_epsilon,
        })
    }

    fn forward(&self, xs: &Tensor, mask: Option<&Tensor>) -> CoreResult<Tensor> {
        let normed = rms_norm(xs, &self.norm, self.eps)?;
        Ok((xs + self.mixer.forward(&normed, mask)?)?)
    }
}

/// Mamba causal language model producing per-token vocabulary logits.
#[derive(Debug)]
pub struct Mamba {
    embeddings: Parameter,
    layers: Vec<MambaBlock>,
    norm_f: Parameter,
    lm_head: Option<Parameter>,
    config: MambaConfig,
}

impl Mamba {
    /// Build a freshly initialised model under `vb`.
    ///
    /// Weights are always randomly initialised here; pretrained or
    /// checkpointed values are loaded into the backing `VarMap` afterwards.
    pub fn new(config: &MambaConfig, vb: VarBuilder) -> CoreResult<Self> {
        config.validate()?;
        let backbone = vb.pp("backbone");
        let embeddings = param(
            &backbone.pp("embeddings"),
            (config.vocab_size, config.hidden_size),
            "weight",
            Init::Randn { mean: 0.0, stdev: EMBEDDING_STD },
        )?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| MambaBlock::new(config, backbone.pp(format!("layers.{i}"))))
            .collect::<CoreResult<Vec<_>>>()?;
        let norm_f = param(&backbone.pp("norm_f"), config.hidden_size, "weight", Init::Const(1.0))?;
        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(param(
                &vb.pp("lm_head"),
                (config.vocab_size, config.hidden_size),
                "weight",
                init::DEFAULT_KAIMING_NORMAL,
            )?)
        };

        debug!(
            hidden_size = config.hidden_size,
            layers = config.num_hidden_layers,
            intermediate = config.intermediate_size(),
            dt_rank = config.dt_rank(),
            "Built Mamba model"
        );

        Ok(Self { embeddings, layers, norm_f, lm_head, config: config.clone() })
    }
}

impl SequenceModel for Mamba {
    fn forward(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>) -> CoreResult<Tensor> {
        let embed = Embedding::new(self.embeddings.tensor(), self.config.hidden_size);
        let mut xs = embed.forward(input_ids)?;
        let mask = match attention_mask {
            Some(m) => Some(m.to_dtype(xs.dtype())?.unsqueeze(2)?),
            None => None,
        };
        for layer in &self.layers {
            xs = layer.forward(&xs, mask.as_ref())?;
        }
        let xs = rms_norm(&xs, &self.norm_f, self.config.layer_norm_epsilon)?;
        let head = self.lm_head.as_ref().unwrap_or(&self.embeddings).tensor();
        Ok(xs.broadcast_matmul(&head.t()?)?)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut out = vec![&self.embeddings];
        for layer in &self.layers {
            out.push(&layer.norm);
            out.extend(layer.mixer.parameters());
        }
        out.push(&self.norm_f);
        out.extend(self.lm_head.as_ref());
        out
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut out = vec![&mut self.embeddings];
        for layer in &mut self.layers {
            out.push(&mut layer.norm);
            out.extend(layer.mixer.parameters_mut());
        }
        out.push(&mut self.norm_f);
        out.extend(self.lm_head.as_mut());
        out
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn layer_count(&self) -> usize {
        self.layers.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    pub(crate) fn tiny_config() -> MambaConfig {
        MambaConfig {
            hidden_size: 8,
            num_hidden_layers: 2,
            vocab_size: 16,
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

    fn build(cfg: &MambaConfig) -> (VarMap, Mamba) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Mamba::new(cfg, vb).unwrap();
        (varmap, model)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b).unwrap().abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn config_parses_hf_json_and_derives_sizes() {
        let json = r#"{
            "hidden_size": 768, "num_hidden_layers": 24, "vocab_size": 50280,
            "state_size": 16, "expand": 2, "conv_kernel": 4,
            "time_step_rank": 48, "intermediate_size": 1536,
            "use_bias": false, "use_conv_bias": true,
            "layer_norm_epsilon": 1e-5, "pad_token_id": 0, "eos_token_id": 0
        }"#;
        let cfg: MambaConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.intermediate_size(), 1536);
        assert_eq!(cfg.dt_rank(), 48);
        assert!(cfg.tie_word_embeddings);

        let student = cfg.shrunk_for_student();
        assert_eq!(student.hidden_size, 384);
        assert_eq!(student.num_hidden_layers, 6);
        assert_eq!(student.intermediate_size(), 768);
        assert_eq!(student.dt_rank(), 24);
        assert_eq!(student.vocab_size, 50280);
    }

    #[test]
    fn shrink_keeps_at_least_one_layer() {
        let mut cfg = tiny_config();
        cfg.num_hidden_layers = 3;
        assert_eq!(cfg.shrunk_for_student().num_hidden_layers, 1);
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let json = r#"{"d_model": 8, "n_layer": 1, "vocab_size": 10}"#;
        let cfg: MambaConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.hidden_size, 8);
        assert_eq!(cfg.num_hidden_layers, 1);
        assert_eq!(cfg.state_size, 16);
    }

    #[test]
    fn zero_hidden_size_is_rejected() {
        let mut cfg = tiny_config();
        cfg.hidden_size = 0;
        assert!(matches!(cfg.validate(), Err(CoreError::Config { .. })));
    }

    #[test]
    fn parameters_follow_checkpoint_order() {
        let (varmap, model) = build(&tiny_config());
        let names: Vec<&str> = model.parameters().iter().map(|p| p.name()).collect();
        assert_eq!(names.len(), 1 + 2 * 10 + 1);
        assert_eq!(names[0], "backbone.embeddings.weight");
        assert_eq!(
            &names[1..11],
            &[
                "backbone.layers.0.norm.weight",
                "backbone.layers.0.mixer.A_log",
                "backbone.layers.0.mixer.D",
                "backbone.layers.0.mixer.conv1d.weight",
                "backbone.layers.0.mixer.conv1d.bias",
                "backbone.layers.0.mixer.in_proj.weight",
                "backbone.layers.0.mixer.x_proj.weight",
                "backbone.layers.0.mixer.dt_proj.weight",
                "backbone.layers.0.mixer.dt_proj.bias",
                "backbone.layers.0.mixer.out_proj.weight",
            ]
        );
        assert_eq!(names[names.len() - 2], "backbone.layers.1.mixer.out_proj.weight");
        assert_eq!(names[names.len() - 1], "backbone.norm_f.weight");
        assert_eq!(varmap.all_vars().len(), names.len());
    }

    #[test]
    fn untied_head_is_registered_last() {
        let mut cfg = tiny_config();
        cfg.tie_word_embeddings = false;
        let (_, model) = build(&cfg);
        let params = model.parameters();
        assert_eq!(params.last().unwrap().name(), "lm_head.weight");
    }

    #[test]
    fn a_log_starts_at_log_state_index() {
        let (_, model) = build(&tiny_config());
        let a_log = model.parameters()[2].tensor();
        let row = a_log.i(0).unwrap().to_vec1::<f32>().unwrap();
        let expected: Vec<f32> = (1..=4).map(|i| (i as f32).ln()).collect();
        for (got, want) in row.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn forward_returns_vocab_logits() {
        let (_, model) = build(&tiny_config());
        let ids = Tensor::new(&[[1u32, 2, 3, 4, 5], [6, 7, 8, 9, 10]], &Device::Cpu).unwrap();
        let logits = model.forward(&ids, None).unwrap();
        assert_eq!(logits.dims(), &[2, 5, 16]);
    }

    #[test]
    fn forward_is_causal() {
        let (_, model) = build(&tiny_config());
        let a = Tensor::new(&[[1u32, 2, 3, 4]], &Device::Cpu).unwrap();
        let b = Tensor::new(&[[1u32, 2, 3, 11]], &Device::Cpu).unwrap();
        let la = model.forward(&a, None).unwrap().narrow(1, 0, 3).unwrap();
        let lb = model.forward(&b, None).unwrap().narrow(1, 0, 3).unwrap();
        assert!(max_abs_diff(&la, &lb) < 1e-5);
    }

    #[test]
    fn masked_left_padding_does_not_leak_into_real_tokens() {
        let (_, model) = build(&tiny_config());
        let plain = Tensor::new(&[[3u32, 4, 5]], &Device::Cpu).unwrap();
        let padded = Tensor::new(&[[9u32, 12, 3, 4, 5]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[0f32, 0., 1., 1., 1.]], &Device::Cpu).unwrap();

        let want = model.forward(&plain, None).unwrap();
        let got = model.forward(&padded, Some(&mask)).unwrap().narrow(1, 2, 3).unwrap();
        assert!(max_abs_diff(&want, &got) < 1e-4);
    }
}
