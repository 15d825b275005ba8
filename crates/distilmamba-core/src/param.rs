use candle_core::{Tensor, Var};

use crate::error::CoreResult;

/// A named weight tensor with a switchable gradient flag.
///
/// Candle tracks gradients for every [`Var`] that takes part in a forward
/// pass. Freezing is expressed by handing the forward pass a detached view
/// of the storage instead, so backprop stops at the parameter while the
/// weights stay shared with the owning `VarMap` (and therefore with
/// checkpoints).
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    var: Var,
    requires_grad: bool,
}

impl Parameter {
    /// Wrap a tensor produced by a `VarMap`-backed `VarBuilder`.
    ///
    /// If `tensor` is already a variable the returned parameter shares its
    /// storage; otherwise the data is copied into a fresh variable.
    pub fn new(name: impl Into<String>, tensor: &Tensor) -> CoreResult<Self> {
        Ok(Self {
            name: name.into(),
            var: Var::from_tensor(tensor)?,
            requires_grad: true,
        })
    }

    /// Fully-qualified checkpoint key (e.g. `backbone.layers.0.mixer.D`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn var(&self) -> &Var {
        &self.var
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
    }

    /// The tensor to use in a forward pass.
    pub fn tensor(&self) -> Tensor {
        if self.requires_grad {
            self.var.as_tensor().clone()
        } else {
            self.var.as_tensor().detach()
        }
    }

    pub fn elem_count(&self) -> usize {
        self.var.as_tensor().elem_count()
    }
}
