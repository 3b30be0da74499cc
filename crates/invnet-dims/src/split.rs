//! Channel-axis split and concatenation.

use candle_core::Tensor;
use invnet_core::{InvNetError, Result};
use tracing::trace;

use crate::layout::{channel_axis, check_same_except_channels};

/// Split `x` along the channel axis at `index`.
///
/// Without an index the midpoint is used, rounding half to even. Either half
/// may be empty.
pub fn tensor_split(x: &Tensor, index: Option<usize>) -> Result<(Tensor, Tensor)> {
    let axis = channel_axis(x, "tensor_split")?;
    let nc = x.dims()[axis];
    let k = match index {
        Some(k) if k > nc => {
            return Err(InvNetError::SplitOutOfRange {
                index: k,
                channels: nc,
            })
        }
        Some(k) => k,
        None if nc == 0 => return Err(InvNetError::EmptyChannelAxis { op: "tensor_split" }),
        None => (nc as f64 / 2.0).round_ties_even() as usize,
    };
    trace!(channels = nc, index = k, "tensor_split");
    let a = x.narrow(axis, 0, k)?;
    let b = x.narrow(axis, k, nc - k)?;
    Ok((a, b))
}

/// Concatenate `a` and `b` along the channel axis.
///
/// An operand with zero channels acts as the identity: the other operand is
/// returned unchanged.
pub fn tensor_cat(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    check_same_except_channels(a, b, "tensor_cat")?;
    let axis = channel_axis(a, "tensor_cat")?;
    if a.dims()[axis] == 0 {
        return Ok(b.clone());
    }
    if b.dims()[axis] == 0 {
        return Ok(a.clone());
    }
    Ok(Tensor::cat(&[a, b], axis)?)
}
