//! # Invertible coupling layers
//!
//! - [`CouplingLayerHint`]: recursive hierarchical coupling over a binary
//!   partition of the channel axis, with optional channel permutation
//! - [`CouplingLayerBasic`]: elementary affine coupling conditioned on a
//!   second tensor
//! - [`Conv1x1`]: orthogonal channel mixing from Householder reflections
//! - [`Parameter`] / [`Trainable`]: parameter values and gradient buffers
//!
//! ```rust,no_run
//! use candle_core::{Device, Tensor};
//! use invnet_core::{HintConfig, PermuteKind};
//! use invnet_layers::CouplingLayerHint;
//!
//! # fn main() -> invnet_core::Result<()> {
//! let config = HintConfig::new(&[16, 16], 8, 16, 2).with_permute(PermuteKind::Full);
//! let mut hint = CouplingLayerHint::new(&config, &Device::Cpu)?;
//! let x = Tensor::randn(0f32, 1.0, (16, 16, 8, 2), &Device::Cpu)?;
//! let out = hint.forward(&x)?;
//! let dy = out.output.ones_like()?;
//! let (dx, x_rec) = hint.backward(&dy, &out.output)?;
//! # let _ = (dx, x_rec);
//! # Ok(())
//! # }
//! ```

pub mod conv1x1;
pub mod coupling;
pub mod hint;
pub mod parameter;

pub use conv1x1::Conv1x1;
pub use coupling::{CouplingLayerBasic, ResidualBlock};
pub use hint::{CouplingLayerHint, HintOutput, Permutation};
pub use parameter::{Parameter, Trainable};
