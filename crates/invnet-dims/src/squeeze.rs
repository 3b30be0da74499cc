//! Spatial-to-channel squeeze and its inverse.
//!
//! Every pattern halves each spatial axis and multiplies the channel count by
//! `2^d` (4 for 4-D tensors, 8 for 5-D tensors). Channel group `g` of the
//! output stores offset `(o_0, .., o_{d-1})` with `g = o_0 + 2*o_1 + 4*o_2`,
//! so the first spatial axis varies fastest across groups.

use candle_core::Tensor;
use invnet_core::{InvNetError, Result};
use std::fmt;
use std::str::FromStr;
use tracing::trace;

use crate::layout::{check_even_spatial, check_rank};

/// Squeeze pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// Contiguous reinterpretation in memory order; no data movement.
    Column,
    /// Group `g` holds one contiguous quadrant (octant) of the grid.
    Patch,
    /// Group `g` holds one stride-2 sublattice.
    Checkerboard,
}

impl Pattern {
    pub const ALL: [Pattern; 3] = [Pattern::Column, Pattern::Patch, Pattern::Checkerboard];
}

impl FromStr for Pattern {
    type Err = InvNetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "column" => Ok(Pattern::Column),
            "patch" => Ok(Pattern::Patch),
            "checkerboard" => Ok(Pattern::Checkerboard),
            other => Err(InvNetError::UnknownPattern(other.to_string())),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Pattern::Column => "column",
            Pattern::Patch => "patch",
            Pattern::Checkerboard => "checkerboard",
        };
        f.write_str(name)
    }
}

/// Split every spatial axis into a (coarse, fine) pair.
///
/// Returns the expanded shape and the axis order that moves all coarse axes
/// first, then the fine axes from last to first, then channel and batch.
fn expansion(pattern: Pattern, half: &[usize], nc: usize, nb: usize) -> (Vec<usize>, Vec<usize>) {
    let d = half.len();
    let mut expanded = Vec::with_capacity(2 * d + 2);
    for &h in half {
        match pattern {
            Pattern::Patch => expanded.extend([2, h]),
            _ => expanded.extend([h, 2]),
        }
    }
    expanded.extend([nc, nb]);

    let (coarse, fine) = match pattern {
        Pattern::Patch => (1, 0),
        _ => (0, 1),
    };
    let mut order: Vec<usize> = (0..d).map(|i| 2 * i + coarse).collect();
    order.extend((0..d).rev().map(|i| 2 * i + fine));
    order.extend([2 * d, 2 * d + 1]);
    (expanded, order)
}

/// Squeeze `x` with the given pattern.
pub fn squeeze(x: &Tensor, pattern: Pattern) -> Result<Tensor> {
    let rank = check_rank(x, "squeeze")?;
    let spatial = check_even_spatial(x, "squeeze")?;
    let (nc, nb) = (x.dims()[rank - 2], x.dims()[rank - 1]);
    let factor = 1usize << spatial.len();
    let half: Vec<usize> = spatial.iter().map(|s| s / 2).collect();

    let mut out_shape = half.clone();
    out_shape.extend([nc * factor, nb]);
    trace!(%pattern, ?spatial, channels = nc, "squeeze");

    let y = match pattern {
        Pattern::Column => x.contiguous()?.reshape(out_shape)?,
        Pattern::Patch | Pattern::Checkerboard => {
            let (expanded, order) = expansion(pattern, &half, nc, nb);
            x.reshape(expanded)?
                .permute(order)?
                .contiguous()?
                .reshape(out_shape)?
        }
    };
    Ok(y)
}

/// Inverse of [`squeeze`] for the same pattern.
pub fn unsqueeze(y: &Tensor, pattern: Pattern) -> Result<Tensor> {
    let rank = check_rank(y, "unsqueeze")?;
    let d = rank - 2;
    let factor = 1usize << d;
    let dims = y.dims();
    let (channels, nb) = (dims[rank - 2], dims[rank - 1]);
    if channels % factor != 0 {
        return Err(InvNetError::ChannelDivisibility {
            op: "unsqueeze",
            channels,
            factor,
        });
    }
    let nc = channels / factor;
    let half = dims[..d].to_vec();

    let mut out_shape: Vec<usize> = half.iter().map(|h| h * 2).collect();
    out_shape.extend([nc, nb]);
    trace!(%pattern, channels, "unsqueeze");

    let x = match pattern {
        Pattern::Column => y.contiguous()?.reshape(out_shape)?,
        Pattern::Patch | Pattern::Checkerboard => {
            let (expanded, order) = expansion(pattern, &half, nc, nb);
            let permuted: Vec<usize> = order.iter().map(|&i| expanded[i]).collect();
            let mut inverse = vec![0; order.len()];
            for (k, &i) in order.iter().enumerate() {
                inverse[i] = k;
            }
            y.reshape(permuted)?
                .permute(inverse)?
                .contiguous()?
                .reshape(out_shape)?
        }
    };
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn ramp(shape: &[usize]) -> candle_core::Result<Tensor> {
        let n: usize = shape.iter().product();
        Tensor::arange(0f32, n as f32, &Device::Cpu)?.reshape(shape)
    }

    /// Value at spatial (i, j), channel c, batch 0 of a 4-D tensor.
    fn at(x: &Tensor, i: usize, j: usize, c: usize) -> candle_core::Result<f32> {
        x.get(i)?.get(j)?.get(c)?.get(0)?.to_scalar::<f32>()
    }

    #[test]
    fn test_squeeze_shapes() -> Result<()> {
        let x = Tensor::zeros((8, 4, 3, 2), DType::F32, &Device::Cpu)?;
        for pattern in Pattern::ALL {
            assert_eq!(squeeze(&x, pattern)?.dims(), &[4, 2, 12, 2]);
        }
        let x = Tensor::zeros((4, 4, 4, 2, 1), DType::F32, &Device::Cpu)?;
        for pattern in Pattern::ALL {
            assert_eq!(squeeze(&x, pattern)?.dims(), &[2, 2, 2, 16, 1]);
        }
        Ok(())
    }

    #[test]
    fn test_checkerboard_groups_are_sublattices() -> Result<()> {
        let x = ramp(&[4, 4, 1, 1])?;
        let y = squeeze(&x, Pattern::Checkerboard)?;
        // group 0: (even, even), 1: (odd, even), 2: (even, odd), 3: (odd, odd)
        for (g, (oi, oj)) in [(0, 0), (1, 0), (0, 1), (1, 1)].into_iter().enumerate() {
            for i in 0..2 {
                for j in 0..2 {
                    assert_eq!(at(&y, i, j, g)?, at(&x, 2 * i + oi, 2 * j + oj, 0)?);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_patch_groups_are_quadrants() -> Result<()> {
        let x = ramp(&[4, 4, 1, 1])?;
        let y = squeeze(&x, Pattern::Patch)?;
        for (g, (qi, qj)) in [(0, 0), (1, 0), (0, 1), (1, 1)].into_iter().enumerate() {
            for i in 0..2 {
                for j in 0..2 {
                    assert_eq!(at(&y, i, j, g)?, at(&x, 2 * qi + i, 2 * qj + j, 0)?);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_column_is_plain_reshape() -> Result<()> {
        let x = ramp(&[4, 4, 2, 1])?;
        let y = squeeze(&x, Pattern::Column)?;
        assert_eq!(
            y.flatten_all()?.to_vec1::<f32>()?,
            x.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_roundtrip_is_exact() -> Result<()> {
        for shape in [vec![6, 4, 3, 2], vec![4, 2, 6, 2, 3]] {
            let x = ramp(&shape)?;
            for pattern in Pattern::ALL {
                let back = unsqueeze(&squeeze(&x, pattern)?, pattern)?;
                assert_eq!(back.dims(), x.dims());
                assert_eq!(
                    back.flatten_all()?.to_vec1::<f32>()?,
                    x.flatten_all()?.to_vec1::<f32>()?,
                    "pattern {pattern} shape {shape:?}"
                );
            }
        }
        Ok(())
    }

    #[test]
    fn test_odd_spatial_rejected() -> Result<()> {
        let x = Tensor::zeros((15, 16, 2, 1), DType::F32, &Device::Cpu)?;
        for pattern in Pattern::ALL {
            let err = squeeze(&x, pattern).unwrap_err();
            assert!(matches!(
                err,
                InvNetError::OddSpatialDim { axis: 0, size: 15, .. }
            ));
        }
        Ok(())
    }

    #[test]
    fn test_unsqueeze_channel_divisibility() -> Result<()> {
        let y = Tensor::zeros((2, 2, 6, 1), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            unsqueeze(&y, Pattern::Patch),
            Err(InvNetError::ChannelDivisibility { factor: 4, .. })
        ));
        let y = Tensor::zeros((2, 2, 2, 12, 1), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            unsqueeze(&y, Pattern::Checkerboard),
            Err(InvNetError::ChannelDivisibility { factor: 8, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_pattern_names() {
        assert_eq!("patch".parse::<Pattern>().unwrap(), Pattern::Patch);
        assert_eq!(Pattern::Checkerboard.to_string(), "checkerboard");
        assert!(matches!(
            "diagonal".parse::<Pattern>(),
            Err(InvNetError::UnknownPattern(_))
        ));
    }
}
