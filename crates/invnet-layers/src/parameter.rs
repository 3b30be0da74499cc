//! Trainable parameters with explicit gradient buffers.
//!
//! Gradients are computed with candle autograd inside each module's backward
//! pass and accumulated here, so callers can run several backward passes
//! before reading or clearing them.

use candle_core::{DType, Device, Tensor, Var};
use invnet_core::{InvNetError, Result};
use rand::rngs::StdRng;
use rand::Rng;

/// A named trainable tensor plus its accumulated gradient.
pub struct Parameter {
    name: String,
    var: Var,
    grad: Option<Tensor>,
}

impl std::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Parameter(name={}, shape={:?}, has_grad={})",
            self.name,
            self.var.dims(),
            self.grad.is_some()
        )
    }
}

impl Parameter {
    pub fn new(name: impl Into<String>, var: Var) -> Self {
        Self {
            name: name.into(),
            var,
            grad: None,
        }
    }

    /// Glorot-uniform initialisation drawn from `rng`.
    pub fn glorot_uniform(
        name: impl Into<String>,
        shape: &[usize],
        fan_in: usize,
        fan_out: usize,
        dtype: DType,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
        let n: usize = shape.iter().product();
        let data: Vec<f64> = (0..n).map(|_| rng.gen_range(-limit..limit)).collect();
        let value = Tensor::from_vec(data, shape, device)?.to_dtype(dtype)?;
        Ok(Self::new(name, Var::from_tensor(&value)?))
    }

    /// Zero-initialised parameter (biases).
    pub fn zeros(
        name: impl Into<String>,
        shape: &[usize],
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let var = candle_nn::Init::Const(0.0).var(shape, dtype, device)?;
        Ok(Self::new(name, var))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> &[usize] {
        self.var.dims()
    }

    /// Tracked tensor: operations on it are recorded for autograd.
    pub fn value(&self) -> &Tensor {
        self.var.as_tensor()
    }

    /// Untracked view of the current value.
    pub fn detached(&self) -> Tensor {
        self.var.as_detached_tensor()
    }

    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    /// Add `g` to the gradient buffer.
    pub fn accumulate(&mut self, g: &Tensor) -> Result<()> {
        if g.dims() != self.dims() {
            return Err(InvNetError::ShapeMismatch {
                op: "accumulate",
                expected: self.dims().to_vec(),
                actual: g.dims().to_vec(),
            });
        }
        let g = g.detach();
        self.grad = Some(match self.grad.take() {
            Some(acc) => (acc + g)?,
            None => g,
        });
        Ok(())
    }

    pub fn clear_grad(&mut self) {
        self.grad = None;
    }

    /// Overwrite the value in place; the shape must match.
    pub fn set_value(&mut self, value: &Tensor) -> Result<()> {
        if value.dims() != self.dims() {
            return Err(InvNetError::ShapeMismatch {
                op: "set_value",
                expected: self.dims().to_vec(),
                actual: value.dims().to_vec(),
            });
        }
        self.var.set(&value.to_dtype(self.var.dtype())?)?;
        Ok(())
    }
}

/// Modules that own trainable parameters.
pub trait Trainable {
    /// Parameters in a stable order.
    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn clear_gradients(&mut self) {
        for p in self.parameters_mut() {
            p.clear_grad();
        }
    }
}
