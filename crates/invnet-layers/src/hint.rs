//! Recursive HINT coupling layer.
//!
//! The channel axis is split in half and each half is transformed recursively;
//! the second half is then coupled to the untouched input of the first. A
//! level recurses while the tensor it splits has more than 4 channels, so
//! level `s` (1-based) always works on `n_in / 2^s` channels per half and uses
//! coupling block `s`.
//!
//! An optional channel permutation is applied at the outermost level only:
//! `Full` mixes all `n_in` channels before the split, `Lower` mixes the second
//! half after it.

use candle_core::{DType, Device, Tensor};
use invnet_core::{HintConfig, InvNetError, PermuteKind, Result};
use invnet_dims::layout::{channels, check_rank, check_same_shape};
use invnet_dims::{tensor_cat, tensor_split};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::conv1x1::Conv1x1;
use crate::coupling::CouplingLayerBasic;
use crate::parameter::{Parameter, Trainable};

/// Channel permutation applied at the outermost recursion level.
pub enum Permutation {
    None,
    /// Mixes the second half (`n_in / 2` channels) after the split.
    Lower(Conv1x1),
    /// Mixes all `n_in` channels before the split.
    Full(Conv1x1),
}

impl Permutation {
    pub fn kind(&self) -> PermuteKind {
        match self {
            Permutation::None => PermuteKind::None,
            Permutation::Lower(_) => PermuteKind::Lower,
            Permutation::Full(_) => PermuteKind::Full,
        }
    }

    fn operator(&self) -> Option<&Conv1x1> {
        match self {
            Permutation::None => None,
            Permutation::Lower(op) | Permutation::Full(op) => Some(op),
        }
    }

    fn operator_mut(&mut self) -> Option<&mut Conv1x1> {
        match self {
            Permutation::None => None,
            Permutation::Lower(op) | Permutation::Full(op) => Some(op),
        }
    }
}

/// Result of a forward pass.
#[derive(Debug, Clone)]
pub struct HintOutput {
    pub output: Tensor,
    /// Accumulated log-determinant; `None` when tracking is disabled.
    pub logdet: Option<f64>,
}

/// Where a recursion level sits in the tree.
#[derive(Debug, Clone, Copy)]
struct Level {
    scale: usize,
    outermost: bool,
}

impl Level {
    fn top() -> Self {
        Self {
            scale: 1,
            outermost: true,
        }
    }

    fn child(self) -> Self {
        Self {
            scale: self.scale + 1,
            outermost: false,
        }
    }
}

/// Recursive hierarchical invertible coupling layer.
pub struct CouplingLayerHint {
    config: HintConfig,
    blocks: Vec<CouplingLayerBasic>,
    permutation: Permutation,
}

impl CouplingLayerHint {
    /// Build an `f32` layer.
    pub fn new(config: &HintConfig, device: &Device) -> Result<Self> {
        Self::with_dtype(config, DType::F32, device)
    }

    pub fn with_dtype(config: &HintConfig, dtype: DType, device: &Device) -> Result<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let depth = config.depth();
        let blocks = (1..=depth)
            .map(|j| {
                CouplingLayerBasic::new(
                    &format!("hint.coupling.{j}"),
                    config.block_width(j),
                    config.n_hidden,
                    &config.kernel,
                    config.logdet,
                    dtype,
                    device,
                    &mut rng,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let permutation = match config.permute {
            PermuteKind::None => Permutation::None,
            PermuteKind::Lower => Permutation::Lower(Conv1x1::new(
                "hint.permute",
                config.n_in / 2,
                dtype,
                device,
                &mut rng,
            )?),
            PermuteKind::Full => Permutation::Full(Conv1x1::new(
                "hint.permute",
                config.n_in,
                dtype,
                device,
                &mut rng,
            )?),
        };

        info!(
            n_in = config.n_in,
            n_hidden = config.n_hidden,
            depth,
            permute = %config.permute,
            logdet = config.logdet,
            "Built HINT coupling layer"
        );

        Ok(Self {
            config: config.clone(),
            blocks,
            permutation,
        })
    }

    pub fn config(&self) -> &HintConfig {
        &self.config
    }

    /// Number of coupling blocks.
    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[CouplingLayerBasic] {
        &self.blocks
    }

    pub fn permutation(&self) -> &Permutation {
        &self.permutation
    }

    fn check_input(&self, x: &Tensor, op: &'static str) -> Result<()> {
        let rank = check_rank(x, op)?;
        let dims = x.dims();
        if rank == self.config.rank()
            && dims[rank - 2] == self.config.n_in
            && dims[..rank - 2]
                .iter()
                .all(|&s| self.config.kernel.preserves_extent(s))
        {
            return Ok(());
        }
        let mut expected = self.config.spatial.clone();
        expected.extend([self.config.n_in, self.config.batch_size]);
        Err(InvNetError::ShapeMismatch {
            op,
            expected,
            actual: x.dims().to_vec(),
        })
    }

    fn block(&self, level: Level) -> Result<&CouplingLayerBasic> {
        self.blocks
            .get(level.scale.wrapping_sub(1))
            .ok_or(InvNetError::DepthExceeded {
                scale: level.scale,
                depth: self.blocks.len(),
            })
    }

    fn block_mut(&mut self, level: Level) -> Result<&mut CouplingLayerBasic> {
        let depth = self.blocks.len();
        self.blocks
            .get_mut(level.scale.wrapping_sub(1))
            .ok_or(InvNetError::DepthExceeded {
                scale: level.scale,
                depth,
            })
    }

    /// Map `X` to `Y`, accumulating the log-determinant when enabled.
    pub fn forward(&self, x: &Tensor) -> Result<HintOutput> {
        self.check_input(x, "hint forward")?;
        let (output, logdet) = self.forward_level(x, Level::top())?;
        Ok(HintOutput {
            output,
            logdet: self.config.logdet.then_some(logdet),
        })
    }

    fn forward_level(&self, x: &Tensor, level: Level) -> Result<(Tensor, f64)> {
        let block = self.block(level)?;
        let x = match (&self.permutation, level.outermost) {
            (Permutation::Full(op), true) => op.forward(x)?,
            _ => x.clone(),
        };
        let recurse = channels(&x)? > 4;
        let (xa, xb) = tensor_split(&x, None)?;
        let xb = match (&self.permutation, level.outermost) {
            (Permutation::Lower(op), true) => op.forward(&xb)?,
            _ => xb,
        };
        debug!(scale = level.scale, channels = channels(&x)?, recurse, "hint forward level");

        let (ya, yb, logdet) = if recurse {
            let ((ya, ld_a), (y_temp, ld_b)) = if self.config.parallel_branches {
                let (a, b) = rayon::join(
                    || self.forward_level(&xa, level.child()),
                    || self.forward_level(&xb, level.child()),
                );
                (a?, b?)
            } else {
                (
                    self.forward_level(&xa, level.child())?,
                    self.forward_level(&xb, level.child())?,
                )
            };
            let (yb, ld_c) = block.forward(&y_temp, &xa)?;
            (ya, yb, ld_a + ld_b + ld_c)
        } else {
            let (yb, ld) = block.forward(&xb, &xa)?;
            (xa, yb, ld)
        };
        Ok((tensor_cat(&ya, &yb)?, logdet))
    }

    /// Map `Y` back to `X`.
    pub fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        self.check_input(y, "hint inverse")?;
        self.inverse_level(y, Level::top())
    }

    fn inverse_level(&self, y: &Tensor, level: Level) -> Result<Tensor> {
        let block = self.block(level)?;
        let recurse = channels(y)? > 4;
        let (ya, yb) = tensor_split(y, None)?;
        debug!(scale = level.scale, channels = channels(y)?, recurse, "hint inverse level");

        let (xa, xb) = if recurse {
            let xa = self.inverse_level(&ya, level.child())?;
            let y_temp = block.inverse(&yb, &xa)?;
            let xb = self.inverse_level(&y_temp, level.child())?;
            (xa, xb)
        } else {
            let xb = block.inverse(&yb, &ya)?;
            (ya, xb)
        };

        let xb = match (&self.permutation, level.outermost) {
            (Permutation::Lower(op), true) => op.inverse(&xb)?,
            _ => xb,
        };
        let x = tensor_cat(&xa, &xb)?;
        match (&self.permutation, level.outermost) {
            (Permutation::Full(op), true) => op.inverse(&x),
            _ => Ok(x),
        }
    }

    /// Propagate `dy` back through the layer, reconstructing `X` from `y`.
    ///
    /// Returns `(dx, x)`; `x` is identical to `inverse(y)`. With logdet
    /// tracking enabled the cotangents are those of `L(Y) - logdet`.
    /// Parameter gradients accumulate into the blocks and the permutation.
    pub fn backward(&mut self, dy: &Tensor, y: &Tensor) -> Result<(Tensor, Tensor)> {
        self.check_input(y, "hint backward")?;
        check_same_shape(y, dy, "hint backward")?;
        self.backward_level(dy, y, Level::top())
    }

    /// [`Self::backward`] taking the cotangent and output as one pair.
    pub fn backward_pair(&mut self, pair: (&Tensor, &Tensor)) -> Result<(Tensor, Tensor)> {
        self.backward(pair.0, pair.1)
    }

    fn backward_level(
        &mut self,
        dy: &Tensor,
        y: &Tensor,
        level: Level,
    ) -> Result<(Tensor, Tensor)> {
        self.block(level)?;
        let recurse = channels(y)? > 4;
        let (ya, yb) = tensor_split(y, None)?;
        let (dya, dyb) = tensor_split(dy, None)?;
        debug!(scale = level.scale, channels = channels(y)?, recurse, "hint backward level");

        let (dxa, xa, dxb, xb) = if recurse {
            let (dxa, xa) = self.backward_level(&dya, &ya, level.child())?;
            let (dy_temp, dxa_cond, y_temp) = self.block_mut(level)?.backward(&dyb, &yb, &xa)?;
            let (dxb, xb) = self.backward_level(&dy_temp, &y_temp, level.child())?;
            ((dxa + dxa_cond)?, xa, dxb, xb)
        } else {
            let (dxb, dxa_cond, xb) = self.block_mut(level)?.backward(&dyb, &yb, &ya)?;
            ((dya + dxa_cond)?, ya, dxb, xb)
        };

        let (dxb, xb) = match (&mut self.permutation, level.outermost) {
            (Permutation::Lower(op), true) => op.backward(&dxb, &xb)?,
            _ => (dxb, xb),
        };
        let dx = tensor_cat(&dxa, &dxb)?;
        let x = tensor_cat(&xa, &xb)?;
        match (&mut self.permutation, level.outermost) {
            (Permutation::Full(op), true) => op.backward(&dx, &x),
            _ => Ok((dx, x)),
        }
    }

    /// Parameters of every coupling block in order, then the permutation's.
    pub fn collect_parameters(&self) -> Vec<&Parameter> {
        self.parameters()
    }

    /// Overwrite all parameters from a list ordered like [`Self::collect_parameters`].
    ///
    /// Every shape is checked before any value is written.
    pub fn set_parameters(&mut self, values: &[Tensor]) -> Result<()> {
        let params = self.parameters_mut();
        if params.len() != values.len() {
            return Err(InvNetError::ShapeMismatch {
                op: "set_parameters",
                expected: vec![params.len()],
                actual: vec![values.len()],
            });
        }
        if let Some((p, v)) = params.iter().zip(values).find(|(p, v)| p.dims() != v.dims()) {
            return Err(InvNetError::ShapeMismatch {
                op: "set_parameters",
                expected: p.dims().to_vec(),
                actual: v.dims().to_vec(),
            });
        }
        for (p, v) in params.into_iter().zip(values) {
            p.set_value(v)?;
        }
        Ok(())
    }

    /// Gradients parallel to [`Self::collect_parameters`], zeros where none
    /// have accumulated.
    pub fn gradients(&self) -> Result<Vec<Tensor>> {
        self.parameters()
            .into_iter()
            .map(|p| -> Result<Tensor> {
                match p.grad() {
                    Some(g) => Ok(g.clone()),
                    None => Ok(p.detached().zeros_like()?),
                }
            })
            .collect()
    }
}

impl Trainable for CouplingLayerHint {
    fn parameters(&self) -> Vec<&Parameter> {
        let mut params: Vec<&Parameter> = self.blocks.iter().flat_map(|b| b.parameters()).collect();
        if let Some(op) = self.permutation.operator() {
            params.extend(op.parameters());
        }
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params: Vec<&mut Parameter> = self
            .blocks
            .iter_mut()
            .flat_map(|b| b.parameters_mut())
            .collect();
        if let Some(op) = self.permutation.operator_mut() {
            params.extend(op.parameters_mut());
        }
        params
    }

    fn clear_gradients(&mut self) {
        for block in self.blocks.iter_mut() {
            block.clear_gradients();
        }
        if let Some(op) = self.permutation.operator_mut() {
            op.clear_gradients();
        }
    }
}
