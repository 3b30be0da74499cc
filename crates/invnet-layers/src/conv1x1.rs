//! Orthogonal 1x1 convolution over the channel axis.
//!
//! The mixing matrix is `W = H(v1) H(v2) H(v3)` where `H(v) = I - 2 v vᵀ / vᵀv`
//! is a Householder reflection. `W` is orthogonal, so the inverse is `Wᵀ` and
//! the log-determinant is zero.

use candle_core::{DType, Device, Tensor};
use invnet_core::{InvNetError, Result};
use invnet_dims::layout::{channels, check_rank, check_same_shape};
use rand::rngs::StdRng;

use crate::parameter::{Parameter, Trainable};

pub struct Conv1x1 {
    channels: usize,
    v: [Parameter; 3],
}

fn householder(v: &Tensor) -> Result<Tensor> {
    let k = v.dims()[0];
    let col = v.reshape((k, 1))?;
    let vtv = v.sqr()?.sum_all()?;
    let outer = col.matmul(&col.t()?)?;
    let reflect = (outer.broadcast_div(&vtv)? * 2.0)?;
    let eye = Tensor::eye(k, v.dtype(), v.device())?;
    Ok((eye - reflect)?)
}

/// Multiply every channel vector of `x` by `m`: `y[.., :, b] = m · x[.., :, b]`.
fn mix_channels(x: &Tensor, m: &Tensor) -> Result<Tensor> {
    let rank = check_rank(x, "conv1x1")?;
    let c = x.dims()[rank - 2];
    // (.., c, b) -> (.., b, c) -> (N, c)
    let moved = x.transpose(rank - 2, rank - 1)?.contiguous()?;
    let moved_dims = moved.dims().to_vec();
    let rows = moved.reshape(((), c))?;
    let mixed = rows.matmul(&m.t()?)?;
    Ok(mixed.reshape(moved_dims)?.transpose(rank - 2, rank - 1)?.contiguous()?)
}

impl Conv1x1 {
    pub fn new(
        name: &str,
        channels: usize,
        dtype: DType,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let make = |i: usize, rng: &mut StdRng| {
            Parameter::glorot_uniform(
                format!("{name}.v{i}"),
                &[channels],
                channels,
                1,
                dtype,
                device,
                rng,
            )
        };
        let v = [make(1, rng)?, make(2, rng)?, make(3, rng)?];
        Ok(Self { channels, v })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    fn weight_from(v: [&Tensor; 3]) -> Result<Tensor> {
        let w = householder(v[0])?.matmul(&householder(v[1])?)?;
        Ok(w.matmul(&householder(v[2])?)?)
    }

    /// Current mixing matrix (untracked).
    pub fn weight(&self) -> Result<Tensor> {
        let [a, b, c] = &self.v;
        Self::weight_from([&a.detached(), &b.detached(), &c.detached()])
    }

    fn check_channels(&self, x: &Tensor, op: &'static str) -> Result<()> {
        let nc = channels(x)?;
        if nc != self.channels {
            return Err(InvNetError::ShapeMismatch {
                op,
                expected: vec![self.channels],
                actual: vec![nc],
            });
        }
        Ok(())
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.check_channels(x, "conv1x1 forward")?;
        mix_channels(x, &self.weight()?)
    }

    pub fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        self.check_channels(y, "conv1x1 inverse")?;
        mix_channels(y, &self.weight()?.t()?)
    }

    /// Returns `(Wᵀ dy, Wᵀ y)` and accumulates the gradient of the
    /// Householder vectors.
    pub fn backward(&mut self, dy: &Tensor, y: &Tensor) -> Result<(Tensor, Tensor)> {
        check_same_shape(y, dy, "conv1x1 backward")?;
        let x = self.inverse(y)?;
        let wt = self.weight()?.t()?;
        let dx = mix_channels(dy, &wt)?;

        let [a, b, c] = &self.v;
        let w = Self::weight_from([a.value(), b.value(), c.value()])?;
        let objective = (mix_channels(&x, &w)? * dy.detach())?.sum_all()?;
        let grads = objective.backward()?;
        for p in self.v.iter_mut() {
            if let Some(g) = grads.get(p.value()) {
                let g = g.clone();
                p.accumulate(&g)?;
            }
        }
        Ok((dx, x))
    }
}

impl Trainable for Conv1x1 {
    fn parameters(&self) -> Vec<&Parameter> {
        self.v.iter().collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.v.iter_mut().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn layer(c: usize) -> Result<Conv1x1> {
        let mut rng = StdRng::seed_from_u64(3);
        Conv1x1::new("perm", c, DType::F64, &Device::Cpu, &mut rng)
    }

    #[test]
    fn test_weight_is_orthogonal() -> Result<()> {
        let conv = layer(6)?;
        let w = conv.weight()?;
        let wtw = w.t()?.matmul(&w)?;
        let eye = Tensor::eye(6, DType::F64, &Device::Cpu)?;
        let err = (wtw - eye)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f64>()?;
        assert!(err < 1e-12);
        Ok(())
    }

    #[test]
    fn test_forward_inverse() -> Result<()> {
        let conv = layer(4)?;
        let x = Tensor::randn(0f64, 1.0, (4, 6, 4, 3), &Device::Cpu)?;
        let y = conv.forward(&x)?;
        assert_eq!(y.dims(), x.dims());
        let back = conv.inverse(&y)?;
        let err = (back - &x)?.abs()?.sum_all()?.to_scalar::<f64>()?;
        assert!(err < 1e-10);
        Ok(())
    }

    #[test]
    fn test_single_channel_is_sign_flip() -> Result<()> {
        let conv = layer(1)?;
        let x = Tensor::ones((2, 2, 1, 1), DType::F64, &Device::Cpu)?;
        let y = conv.forward(&x)?.flatten_all()?.to_vec1::<f64>()?;
        assert!(y.iter().all(|v| (v + 1.0).abs() < 1e-12));
        Ok(())
    }

    #[test]
    fn test_backward_returns_preimage_and_grads() -> Result<()> {
        let mut conv = layer(4)?;
        let x = Tensor::randn(0f64, 1.0, (4, 4, 2, 4, 1), &Device::Cpu)?;
        let y = conv.forward(&x)?;
        let dy = Tensor::randn(0f64, 1.0, y.dims(), &Device::Cpu)?;
        let (dx, x_rec) = conv.backward(&dy, &y)?;
        let inv = conv.inverse(&y)?;
        assert_eq!(
            x_rec.flatten_all()?.to_vec1::<f64>()?,
            inv.flatten_all()?.to_vec1::<f64>()?
        );
        // <dy, W x> == <Wᵀ dy, x>
        let lhs = (&dy * &y)?.sum_all()?.to_scalar::<f64>()?;
        let rhs = (&dx * &x_rec)?.sum_all()?.to_scalar::<f64>()?;
        assert!((lhs - rhs).abs() < 1e-9);
        assert!(conv.parameters().iter().all(|p| p.grad().is_some()));
        conv.clear_gradients();
        assert!(conv.parameters().iter().all(|p| p.grad().is_none()));
        Ok(())
    }

    #[test]
    fn test_wrong_channel_count_rejected() -> Result<()> {
        let conv = layer(4)?;
        let x = Tensor::zeros((2, 2, 3, 1), DType::F64, &Device::Cpu)?;
        assert!(conv.forward(&x).unwrap_err().is_shape_error());
        Ok(())
    }
}
