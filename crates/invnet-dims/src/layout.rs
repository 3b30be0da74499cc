//! Axis conventions for flow tensors.
//!
//! Tensors are `(nx, ny, nc, nb)` or `(nx, ny, nz, nc, nb)`: spatial axes
//! first, channel axis second to last, batch axis last.

use candle_core::Tensor;
use invnet_core::{InvNetError, Result};

/// Check the rank is 4 or 5 and return it.
pub fn check_rank(x: &Tensor, op: &'static str) -> Result<usize> {
    let rank = x.rank();
    if !matches!(rank, 4 | 5) {
        return Err(InvNetError::UnsupportedRank { op, rank });
    }
    Ok(rank)
}

/// Index of the channel axis.
pub fn channel_axis(x: &Tensor, op: &'static str) -> Result<usize> {
    Ok(check_rank(x, op)? - 2)
}

/// Number of channels.
pub fn channels(x: &Tensor) -> Result<usize> {
    let axis = channel_axis(x, "channels")?;
    Ok(x.dims()[axis])
}

/// Batch size (last axis).
pub fn batch_size(x: &Tensor) -> Result<usize> {
    let rank = check_rank(x, "batch_size")?;
    Ok(x.dims()[rank - 1])
}

/// Spatial extents.
pub fn spatial_dims(x: &Tensor, op: &'static str) -> Result<Vec<usize>> {
    let rank = check_rank(x, op)?;
    Ok(x.dims()[..rank - 2].to_vec())
}

/// Reject any odd spatial extent.
pub fn check_even_spatial(x: &Tensor, op: &'static str) -> Result<Vec<usize>> {
    let spatial = spatial_dims(x, op)?;
    if let Some((axis, &size)) = spatial.iter().enumerate().find(|(_, &s)| s % 2 != 0) {
        return Err(InvNetError::OddSpatialDim { op, axis, size });
    }
    Ok(spatial)
}

/// Check two tensors agree on every axis except the channel axis.
pub fn check_same_except_channels(a: &Tensor, b: &Tensor, op: &'static str) -> Result<()> {
    let axis = channel_axis(a, op)?;
    let mismatch = || InvNetError::ShapeMismatch {
        op,
        expected: a.dims().to_vec(),
        actual: b.dims().to_vec(),
    };
    if a.rank() != b.rank() {
        return Err(mismatch());
    }
    let same = a
        .dims()
        .iter()
        .zip(b.dims())
        .enumerate()
        .all(|(i, (da, db))| i == axis || da == db);
    if !same {
        return Err(mismatch());
    }
    Ok(())
}

/// Check two tensors have identical shapes.
pub fn check_same_shape(a: &Tensor, b: &Tensor, op: &'static str) -> Result<()> {
    if a.dims() != b.dims() {
        return Err(InvNetError::ShapeMismatch {
            op,
            expected: a.dims().to_vec(),
            actual: b.dims().to_vec(),
        });
    }
    Ok(())
}
