//! # invnet
//!
//! Invertible building blocks for normalizing flows on candle tensors.
//!
//! - [`invnet_core`]: error taxonomy, HINT configuration and logging setup
//! - [`invnet_dims`]: channel split/cat, squeeze patterns and wavelet squeeze
//! - [`invnet_layers`]: the recursive HINT coupling layer and its collaborators
//!
//! The most used items are re-exported at the crate root.

pub use invnet_core;
pub use invnet_dims;
pub use invnet_layers;

pub use invnet_core::{get_depth, HintConfig, InvNetError, KernelConfig, PermuteKind, Result};
pub use invnet_dims::{
    squeeze, tensor_cat, tensor_split, unsqueeze, wavelet_squeeze, wavelet_unsqueeze, Pattern,
    WaveletFilter,
};
pub use invnet_layers::{CouplingLayerHint, HintOutput, Parameter, Trainable};
