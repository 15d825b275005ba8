//! Optimiser plumbing: parameter groups, global-norm clipping and gradient
//! accumulation on top of candle's [`GradStore`].

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use tracing::debug;

const CLIP_EPS: f64 = 1e-6;

/// Variables that share a base learning rate.
pub struct ParamGroup {
    pub name: &'static str,
    pub vars: Vec<Var>,
    pub learning_rate: f64,
}

struct GroupState {
    name: &'static str,
    base_lr: f64,
    optimizer: AdamW,
}

/// AdamW with one independent optimiser per parameter group.
pub struct GroupedAdamW {
    groups: Vec<GroupState>,
}

impl GroupedAdamW {
    pub fn new(groups: Vec<ParamGroup>, weight_decay: f64) -> Result<Self> {
        let mut states = Vec::with_capacity(groups.len());
        for group in groups {
            if group.vars.is_empty() {
                debug!(group = group.name, "Skipping empty parameter group");
                continue;
            }
            let params = ParamsAdamW { lr: group.learning_rate, weight_decay, ..Default::default() };
            let optimizer = AdamW::new(group.vars, params)
                .with_context(|| format!("Failed to create AdamW for group '{}'", group.name))?;
            states.push(GroupState { name: group.name, base_lr: group.learning_rate, optimizer });
        }
        anyhow::ensure!(!states.is_empty(), "no trainable parameters");
        Ok(Self { groups: states })
    }

    /// Scale every group's learning rate to `factor * base_lr`.
    pub fn set_lr_factor(&mut self, factor: f64) {
        for g in &mut self.groups {
            g.optimizer.set_learning_rate(g.base_lr * factor);
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        for g in &mut self.groups {
            g.optimizer
                .step(grads)
                .with_context(|| format!("Optimiser step failed for group '{}'", g.name))?;
        }
        Ok(())
    }

    /// Current learning rate per group, in construction order.
    pub fn learning_rates(&self) -> Vec<(&'static str, f64)> {
        self.groups.iter().map(|g| (g.name, g.optimizer.learning_rate())).collect()
    }
}

/// Global L2 norm of the gradients of `vars` present in `grads`.
pub fn grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var) {
            total += g.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt())
}

/// Rescale gradients in place so their global norm is at most `max_norm`.
///
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let norm = grad_norm(grads, vars)?;
    if norm > max_norm {
        let coef = max_norm / (norm + CLIP_EPS);
        for var in vars {
            let scaled = match grads.get(var) {
                Some(g) => g.affine(coef, 0.0)?,
                None => continue,
            };
            grads.insert(var, scaled);
        }
    }
    Ok(norm)
}

/// Sums the gradients of several backward passes.
///
/// Only the tracked variables are summed; other entries of the first store
/// are kept as they were and ignored by the optimiser.
pub struct GradAccumulator {
    vars: Vec<Var>,
    pending: Option<GradStore>,
    micro_steps: usize,
}

impl GradAccumulator {
    pub fn new(vars: Vec<Var>) -> Self {
        Self { vars, pending: None, micro_steps: 0 }
    }

    pub fn add(&mut self, grads: GradStore) -> Result<()> {
        self.micro_steps += 1;
        let Some(acc) = self.pending.as_mut() else {
            self.pending = Some(grads);
            return Ok(());
        };
        for var in &self.vars {
            let Some(new) = grads.get(var) else { continue };
            let summed = match acc.get(var) {
                Some(old) => (old + new)?,
                None => new.clone(),
            };
            acc.insert(var, summed);
        }
        Ok(())
    }

    /// Number of backward passes summed since the last [`take`](Self::take).
    pub fn micro_steps(&self) -> usize {
        self.micro_steps
    }

    /// Hand over the summed gradients and start from zero again.
    pub fn take(&mut self) -> Option<GradStore> {
        self.micro_steps = 0;
        self.pending.take()
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};
    use candle_nn::SGD;

    const XS: [f32; 4] = [1.0, -2.0, 0.5, 3.0];
    const YS: [f32; 4] = [2.0, 0.0, 1.5, -1.0];

    fn toy_params() -> (Var, Var) {
        let w = Var::new(0.7f32, &Device::Cpu).unwrap();
        let b = Var::new(-0.3f32, &Device::Cpu).unwrap();
        (w, b)
    }

    /// Squared error of `w * x + b` against `y`.
    fn step_loss(w: &Var, b: &Var, i: usize) -> Tensor {
        let x = Tensor::new(XS[i], &Device::Cpu).unwrap();
        let y = Tensor::new(YS[i], &Device::Cpu).unwrap();
        let pred = ((w.as_tensor() * x).unwrap() + b.as_tensor()).unwrap();
        (pred - y).unwrap().sqr().unwrap()
    }

    fn values(w: &Var, b: &Var) -> (f32, f32) {
        (w.to_scalar::<f32>().unwrap(), b.to_scalar::<f32>().unwrap())
    }

    fn accumulated_update(n: usize, make_opt: impl Fn(Vec<Var>) -> Box<dyn FnMut(&GradStore)>) -> (f32, f32) {
        let (w, b) = toy_params();
        let mut step = make_opt(vec![w.clone(), b.clone()]);
        let mut acc = GradAccumulator::new(vec![w.clone(), b.clone()]);
        for i in 0..n {
            let loss = step_loss(&w, &b, i).affine(1.0 / n as f64, 0.0).unwrap();
            acc.add(loss.backward().unwrap()).unwrap();
        }
        assert_eq!(acc.micro_steps(), n);
        step(&acc.take().unwrap());
        assert_eq!(acc.micro_steps(), 0);
        values(&w, &b)
    }

    fn mean_loss_update(n: usize, make_opt: impl Fn(Vec<Var>) -> Box<dyn FnMut(&GradStore)>) -> (f32, f32) {
        let (w, b) = toy_params();
        let mut step = make_opt(vec![w.clone(), b.clone()]);
        let losses: Vec<Tensor> = (0..n).map(|i| step_loss(&w, &b, i)).collect();
        let mean = Tensor::stack(&losses, 0).unwrap().mean_all().unwrap();
        step(&mean.backward().unwrap());
        values(&w, &b)
    }

    fn sgd(vars: Vec<Var>) -> Box<dyn FnMut(&GradStore)> {
        let mut opt = SGD::new(vars, 0.1).unwrap();
        Box::new(move |g| opt.step(g).unwrap())
    }

    fn adamw(vars: Vec<Var>) -> Box<dyn FnMut(&GradStore)> {
        let mut opt = GroupedAdamW::new(vec![ParamGroup { name: "all", vars, learning_rate: 0.05 }], 0.01).unwrap();
        Box::new(move |g| opt.step(g).unwrap())
    }

    #[test]
    fn accumulation_matches_single_step_on_mean_loss() {
        for n in 1..=4 {
            for make in [sgd as fn(Vec<Var>) -> Box<dyn FnMut(&GradStore)>, adamw] {
                let (aw, ab) = accumulated_update(n, make);
                let (mw, mb) = mean_loss_update(n, make);
                assert!((aw - mw).abs() < 1e-5, "n={n}: w {aw} vs {mw}");
                assert!((ab - mb).abs() < 1e-5, "n={n}: b {ab} vs {mb}");
            }
        }
    }

    fn store_with_grad(values: &[f32]) -> (Var, GradStore) {
        let v = Var::zeros(values.len(), DType::F32, &Device::Cpu).unwrap();
        let coeffs = Tensor::new(values, &Device::Cpu).unwrap();
        let grads = (v.as_tensor() * coeffs).unwrap().sum_all().unwrap().backward().unwrap();
        (v, grads)
    }

    #[test]
    fn clipping_scales_to_max_norm() {
        let (v, mut grads) = store_with_grad(&[3.0, 4.0]);
        let vars = [v.clone()];
        let norm = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        let clipped = grads.get(&v).unwrap().to_vec1::<f32>().unwrap();
        assert!((clipped[0] - 0.6).abs() < 1e-5 && (clipped[1] - 0.8).abs() < 1e-5);
        assert!((grad_norm(&grads, &vars).unwrap() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn small_gradients_are_left_alone() {
        let (v, mut grads) = store_with_grad(&[0.3, 0.4]);
        let norm = clip_grad_norm(&mut grads, &[v.clone()], 1.0).unwrap();
        assert!((norm - 0.5).abs() < 1e-6);
        assert_eq!(grads.get(&v).unwrap().to_vec1::<f32>().unwrap(), vec![0.3, 0.4]);
    }

    #[test]
    fn lr_factor_scales_each_group() {
        let (w, b) = toy_params();
        let mut opt = GroupedAdamW::new(
            vec![
                ParamGroup { name: "head", vars: vec![w.clone()], learning_rate: 1e-3 },
                ParamGroup { name: "base", vars: vec![b.clone()], learning_rate: 1e-4 },
                ParamGroup { name: "frozen", vars: vec![], learning_rate: 1.0 },
            ],
            0.01,
        )
        .unwrap();
        opt.set_lr_factor(0.5);
        let lrs = opt.learning_rates();
        assert_eq!(lrs.len(), 2);
        assert!((lrs[0].1 - 5e-4).abs() < 1e-12 && (lrs[1].1 - 5e-5).abs() < 1e-12);

        // A zero learning rate leaves the weights untouched.
        opt.set_lr_factor(0.0);
        let before = values(&w, &b);
        opt.step(&step_loss(&w, &b, 0).backward().unwrap()).unwrap();
        assert_eq!(values(&w, &b), before);
    }

    #[test]
    fn empty_groups_are_rejected() {
        assert!(GroupedAdamW::new(vec![ParamGroup { name: "x", vars: vec![], learning_rate: 1.0 }], 0.0).is_err());
    }
}
