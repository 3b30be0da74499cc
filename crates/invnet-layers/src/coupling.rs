//! Affine coupling layer conditioned on a second tensor.
//!
//! `y = S(c) ⊙ x + T(c)` with `S = 2·sigmoid(raw)`, where `(raw, T)` are the
//! two channel halves of a small residual network applied to `c`.
//! Backward re-derives `x` with [`CouplingLayerBasic::inverse`] and
//! differentiates through candle autograd, so the layer keeps no activation
//! cache between calls.

use candle_core::{DType, Device, Tensor, Var};
use invnet_core::{InvNetError, KernelConfig, Result};
use invnet_dims::layout::{batch_size, channels, check_rank, check_same_shape};
use invnet_dims::tensor_split;
use rand::rngs::StdRng;
use tracing::trace;

use crate::parameter::{Parameter, Trainable};

/// Flow layout `(nx, ny, [nz,] c, b)` to conv layout `(N, c, ny, nx)`.
fn to_nchw(x: &Tensor) -> Result<Tensor> {
    match check_rank(x, "to_nchw")? {
        4 => Ok(x.permute([3, 2, 1, 0])?.contiguous()?),
        _ => {
            let (nx, ny, nz, c, b) = x.dims5()?;
            Ok(x
                .permute([4, 2, 3, 1, 0])?
                .contiguous()?
                .reshape((b * nz, c, ny, nx))?)
        }
    }
}

/// Conv layout back to flow layout; `like` supplies the spatial extents.
fn from_nchw(h: &Tensor, like: &Tensor) -> Result<Tensor> {
    match check_rank(like, "from_nchw")? {
        4 => Ok(h.permute([3, 2, 1, 0])?.contiguous()?),
        _ => {
            let (nx, ny, nz, _, b) = like.dims5()?;
            let c = h.dims()[1];
            Ok(h.reshape((b, nz, c, ny, nx))?
                .permute([4, 3, 1, 2, 0])?
                .contiguous()?)
        }
    }
}

/// One convolution with bias.
struct Conv {
    weight: Parameter,
    bias: Parameter,
    padding: usize,
    stride: usize,
}

impl Conv {
    #[allow(clippy::too_many_arguments)]
    fn new(
        name: &str,
        c_in: usize,
        c_out: usize,
        k: usize,
        padding: usize,
        stride: usize,
        dtype: DType,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let weight = Parameter::glorot_uniform(
            format!("{name}.weight"),
            &[c_out, c_in, k, k],
            c_in * k * k,
            c_out * k * k,
            dtype,
            device,
            rng,
        )?;
        let bias = Parameter::zeros(format!("{name}.bias"), &[c_out], dtype, device)?;
        Ok(Self {
            weight,
            bias,
            padding,
            stride,
        })
    }

    fn forward(&self, x: &Tensor, tracked: bool) -> Result<Tensor> {
        let (w, b) = if tracked {
            (self.weight.value().clone(), self.bias.value().clone())
        } else {
            (self.weight.detached(), self.bias.detached())
        };
        let c_out = b.dims()[0];
        let h = x.conv2d(&w, self.padding, self.stride, 1, 1)?;
        Ok(h.broadcast_add(&b.reshape((1, c_out, 1, 1))?)?)
    }
}

/// conv(k1) → SiLU → conv(k2) → SiLU → conv(k1).
pub struct ResidualBlock {
    conv1: Conv,
    conv2: Conv,
    conv3: Conv,
}

impl ResidualBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        n_in: usize,
        n_hidden: usize,
        n_out: usize,
        kernel: &KernelConfig,
        dtype: DType,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let mut conv = |i: usize, c_in: usize, c_out: usize, k: usize, p: usize, s: usize| {
            Conv::new(&format!("{name}.conv{i}"), c_in, c_out, k, p, s, dtype, device, rng)
        };
        let k = kernel;
        Ok(Self {
            conv1: conv(1, n_in, n_hidden, k.k1, k.p1, k.s1)?,
            conv2: conv(2, n_hidden, n_hidden, k.k2, k.p2, k.s2)?,
            conv3: conv(3, n_hidden, n_out, k.k1, k.p1, k.s1)?,
        })
    }

    /// Apply the block to a flow-layout tensor.
    pub fn forward(&self, x: &Tensor, tracked: bool) -> Result<Tensor> {
        let h = to_nchw(x)?;
        let h = candle_nn::ops::silu(&self.conv1.forward(&h, tracked)?)?;
        let h = candle_nn::ops::silu(&self.conv2.forward(&h, tracked)?)?;
        let h = self.conv3.forward(&h, tracked)?;
        from_nchw(&h, x)
    }
}

impl Trainable for ResidualBlock {
    fn parameters(&self) -> Vec<&Parameter> {
        [&self.conv1, &self.conv2, &self.conv3]
            .into_iter()
            .flat_map(|c| [&c.weight, &c.bias])
            .collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        [&mut self.conv1, &mut self.conv2, &mut self.conv3]
            .into_iter()
            .flat_map(|c| [&mut c.weight, &mut c.bias])
            .collect()
    }
}

/// Elementary affine coupling layer for `n_in` channels.
pub struct CouplingLayerBasic {
    n_in: usize,
    logdet: bool,
    rb: ResidualBlock,
}

impl CouplingLayerBasic {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        n_in: usize,
        n_hidden: usize,
        kernel: &KernelConfig,
        logdet: bool,
        dtype: DType,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let rb = ResidualBlock::new(
            &format!("{name}.rb"),
            n_in,
            n_hidden,
            2 * n_in,
            kernel,
            dtype,
            device,
            rng,
        )?;
        Ok(Self { n_in, logdet, rb })
    }

    pub fn n_in(&self) -> usize {
        self.n_in
    }

    fn check_operands(&self, x: &Tensor, cond: &Tensor, op: &'static str) -> Result<()> {
        check_same_shape(cond, x, op)?;
        let nc = channels(x)?;
        if nc != self.n_in {
            return Err(InvNetError::ShapeMismatch {
                op,
                expected: vec![self.n_in],
                actual: vec![nc],
            });
        }
        Ok(())
    }

    /// Scale `S` and shift `T` for a conditioning tensor.
    fn scale_shift(&self, cond: &Tensor, tracked: bool) -> Result<(Tensor, Tensor)> {
        let out = self.rb.forward(cond, tracked)?;
        let (raw, t) = tensor_split(&out, Some(self.n_in))?;
        let s = (candle_nn::ops::sigmoid(&raw.contiguous()?)? * 2.0)?;
        Ok((s, t))
    }

    /// Σ log S / batch size, as a tensor so it can be differentiated.
    fn logdet_of(s: &Tensor, nb: usize) -> Result<Tensor> {
        Ok((s.log()?.sum_all()? / nb as f64)?)
    }

    /// Returns `y` and the log-determinant (0 when tracking is disabled).
    pub fn forward(&self, x: &Tensor, cond: &Tensor) -> Result<(Tensor, f64)> {
        self.check_operands(x, cond, "coupling forward")?;
        let (s, t) = self.scale_shift(cond, false)?;
        let y = (x * &s)?.add(&t)?;
        let logdet = if self.logdet {
            Self::logdet_of(&s, batch_size(x)?)?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?
        } else {
            0.0
        };
        trace!(channels = self.n_in, logdet, "coupling forward");
        Ok((y, logdet))
    }

    pub fn inverse(&self, y: &Tensor, cond: &Tensor) -> Result<Tensor> {
        self.check_operands(y, cond, "coupling inverse")?;
        let (s, t) = self.scale_shift(cond, false)?;
        Ok(y.sub(&t)?.div(&s)?)
    }

    /// Returns `(dx, dcond, x)`.
    ///
    /// `x` comes from [`Self::inverse`]. The cotangents are those of
    /// `⟨dy, y⟩ - logdet` (the logdet term only when tracking is enabled);
    /// parameter gradients of the same objective are accumulated.
    pub fn backward(
        &mut self,
        dy: &Tensor,
        y: &Tensor,
        cond: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        check_same_shape(y, dy, "coupling backward")?;
        let x = self.inverse(y, cond)?;

        let xv = Var::from_tensor(&x)?;
        let cv = Var::from_tensor(cond)?;
        let (s, t) = self.scale_shift(cv.as_tensor(), true)?;
        let y_tracked = (xv.as_tensor() * &s)?.add(&t)?;
        let mut objective = (y_tracked * dy.detach())?.sum_all()?;
        if self.logdet {
            objective = (objective - Self::logdet_of(&s, batch_size(y)?)?)?;
        }
        let grads = objective.backward()?;

        let dx = match grads.get(xv.as_tensor()) {
            Some(g) => g.clone(),
            None => x.zeros_like()?,
        };
        let dcond = match grads.get(cv.as_tensor()) {
            Some(g) => g.clone(),
            None => cond.zeros_like()?,
        };
        for p in self.rb.parameters_mut() {
            if let Some(g) = grads.get(p.value()) {
                let g = g.clone();
                p.accumulate(&g)?;
            }
        }
        Ok((dx, dcond, x))
    }
}

impl Trainable for CouplingLayerBasic {
    fn parameters(&self) -> Vec<&Parameter> {
        self.rb.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.rb.parameters_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn layer(n_in: usize, logdet: bool) -> Result<CouplingLayerBasic> {
        let mut rng = StdRng::seed_from_u64(11);
        CouplingLayerBasic::new(
            "cl",
            n_in,
            8,
            &KernelConfig::default(),
            logdet,
            DType::F64,
            &Device::Cpu,
            &mut rng,
        )
    }

    fn randn(shape: &[usize]) -> candle_core::Result<Tensor> {
        Tensor::randn(0f64, 1.0, shape, &Device::Cpu)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f64> {
        (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f64>()
    }

    #[test]
    fn test_layout_roundtrip() -> Result<()> {
        for shape in [vec![6, 4, 3, 2], vec![6, 4, 2, 3, 2]] {
            let x = randn(&shape)?;
            let back = from_nchw(&to_nchw(&x)?, &x)?;
            assert_eq!(back.dims(), x.dims());
            assert_eq!(max_abs_diff(&back, &x)?, 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_forward_inverse() -> Result<()> {
        let cl = layer(2, true)?;
        for shape in [vec![8, 8, 2, 3], vec![4, 4, 4, 2, 2]] {
            let x = randn(&shape)?;
            let c = randn(&shape)?;
            let (y, logdet) = cl.forward(&x, &c)?;
            assert_eq!(y.dims(), x.dims());
            assert!(logdet.is_finite() && logdet != 0.0);
            let back = cl.inverse(&y, &c)?;
            assert!(max_abs_diff(&back, &x)? < 1e-10);
        }
        Ok(())
    }

    #[test]
    fn test_logdet_disabled_is_zero() -> Result<()> {
        let cl = layer(2, false)?;
        let x = randn(&[4, 4, 2, 1])?;
        let (_, logdet) = cl.forward(&x, &x)?;
        assert_eq!(logdet, 0.0);
        Ok(())
    }

    #[test]
    fn test_backward_matches_inverse_and_accumulates() -> Result<()> {
        let mut cl = layer(2, true)?;
        let x = randn(&[4, 4, 2, 2])?;
        let c = randn(&[4, 4, 2, 2])?;
        let (y, _) = cl.forward(&x, &c)?;
        let dy = randn(y.dims())?;
        let (dx, dc, x_rec) = cl.backward(&dy, &y, &c)?;
        let inv = cl.inverse(&y, &c)?;
        assert_eq!(max_abs_diff(&x_rec, &inv)?, 0.0);
        assert_eq!(dx.dims(), x.dims());
        assert_eq!(dc.dims(), c.dims());
        assert!(cl.parameters().iter().all(|p| p.grad().is_some()));

        let first = cl.parameters()[0].grad().unwrap().clone();
        cl.backward(&dy, &y, &c)?;
        let second = cl.parameters()[0].grad().unwrap().clone();
        assert!(max_abs_diff(&(first * 2.0)?, &second)? < 1e-10);

        cl.clear_gradients();
        assert!(cl.parameters().iter().all(|p| p.grad().is_none()));
        Ok(())
    }

    #[test]
    fn test_input_cotangent_matches_directional_difference() -> Result<()> {
        let mut cl = layer(2, false)?;
        let x = randn(&[4, 4, 2, 1])?;
        let c = randn(&[4, 4, 2, 1])?;
        let (y, _) = cl.forward(&x, &c)?;
        let dy = randn(y.dims())?;
        let (dx, _, _) = cl.backward(&dy, &y, &c)?;
        // y is affine in x, so a directional difference is exact up to rounding
        let h = 1e-6;
        let v = randn(x.dims())?;
        let (y_plus, _) = cl.forward(&(&x + (&v * h)?)?, &c)?;
        let fd = ((y_plus - &y)? * &dy)?.sum_all()?.to_scalar::<f64>()? / h;
        let an = (&dx * &v)?.sum_all()?.to_scalar::<f64>()?;
        assert!((fd - an).abs() < 1e-5 * an.abs().max(1.0));
        Ok(())
    }

    #[test]
    fn test_parameter_gradients_match_central_difference() -> Result<()> {
        let mut cl = layer(2, true)?;
        let x = randn(&[6, 6, 2, 2])?;
        let c = randn(&[6, 6, 2, 2])?;
        let (y, _) = cl.forward(&x, &c)?;
        let dy = randn(y.dims())?;
        cl.backward(&dy, &y, &c)?;
        let grads: Vec<Tensor> = cl
            .parameters()
            .iter()
            .map(|p| p.grad().expect("gradient accumulated").clone())
            .collect();

        // ⟨dy, y(x)⟩ - logdet with x held fixed
        let objective = |cl: &CouplingLayerBasic| -> Result<f64> {
            let (y, logdet) = cl.forward(&x, &c)?;
            Ok((y * &dy)?.sum_all()?.to_scalar::<f64>()? - logdet)
        };

        let h = 1e-5;
        for (i, grad) in grads.iter().enumerate() {
            let theta = cl.parameters()[i].detached().copy()?;
            let v = randn(theta.dims())?;
            cl.parameters_mut()[i].set_value(&(&theta + (&v * h)?)?)?;
            let f_plus = objective(&cl)?;
            cl.parameters_mut()[i].set_value(&(&theta - (&v * h)?)?)?;
            let f_minus = objective(&cl)?;
            cl.parameters_mut()[i].set_value(&theta)?;

            let fd = (f_plus - f_minus) / (2.0 * h);
            let an = (grad * &v)?.sum_all()?.to_scalar::<f64>()?;
            let name = cl.parameters()[i].name().to_string();
            assert!(
                (fd - an).abs() < 1e-6 * an.abs().max(1.0),
                "{name}: finite difference {fd} vs gradient {an}"
            );
        }
        Ok(())
    }

    #[test]
    fn test_parameter_names_and_order() -> Result<()> {
        let cl = layer(2, true)?;
        let names: Vec<&str> = cl.parameters().iter().map(|p| p.name()).collect();
        assert_eq!(
            names,
            vec![
                "cl.rb.conv1.weight",
                "cl.rb.conv1.bias",
                "cl.rb.conv2.weight",
                "cl.rb.conv2.bias",
                "cl.rb.conv3.weight",
                "cl.rb.conv3.bias",
            ]
        );
        assert_eq!(cl.parameters()[4].dims(), &[4, 8, 3, 3]);
        Ok(())
    }

    #[test]
    fn test_mismatched_operands_rejected() -> Result<()> {
        let cl = layer(2, true)?;
        let x = randn(&[4, 4, 2, 1])?;
        let c = randn(&[4, 4, 4, 1])?;
        assert!(cl.forward(&x, &c).unwrap_err().is_shape_error());
        let x = randn(&[4, 4, 3, 1])?;
        assert!(cl.forward(&x, &x).unwrap_err().is_shape_error());
        Ok(())
    }
}
