//! # Dimensionality operations
//!
//! Stateless reshaping of `(nx, ny, [nz,] nc, nb)` tensors used to prepare
//! inputs for invertible layers:
//!
//! - **split / cat**: halve the channel axis and join it back
//! - **squeeze / unsqueeze**: trade spatial resolution for channels with the
//!   column, patch or checkerboard pattern
//! - **wavelet squeeze**: orthonormal subband decomposition packed into channels
//!
//! ```rust,no_run
//! use candle_core::{DType, Device, Tensor};
//! use invnet_dims::{squeeze, tensor_split, unsqueeze, Pattern};
//!
//! # fn main() -> invnet_core::Result<()> {
//! let x = Tensor::zeros((16, 16, 2, 4), DType::F32, &Device::Cpu)?;
//! let y = squeeze(&x, Pattern::Checkerboard)?; // (8, 8, 8, 4)
//! let (a, b) = tensor_split(&y, None)?;
//! assert_eq!(a.dims(), b.dims());
//! let back = unsqueeze(&y, Pattern::Checkerboard)?;
//! assert_eq!(back.dims(), x.dims());
//! # Ok(())
//! # }
//! ```

pub mod layout;
pub mod split;
pub mod squeeze;
pub mod wavelet;

pub use split::{tensor_cat, tensor_split};
pub use squeeze::{squeeze, unsqueeze, Pattern};
pub use wavelet::{wavelet_squeeze, wavelet_unsqueeze, WaveletFilter};
