//! Single-level separable wavelet squeeze.
//!
//! Each spatial axis is split into periodic low/high subbands with an
//! orthonormal filter pair, then the subbands are packed into the channel axis
//! with the patch squeeze. Channel group 0 holds the all-lowpass band.

use candle_core::Tensor;
use invnet_core::{InvNetError, Result};
use std::fmt;
use std::str::FromStr;
use tracing::trace;

use crate::layout::{check_even_spatial, check_rank};
use crate::squeeze::{squeeze, unsqueeze, Pattern};

/// Orthonormal wavelet filter bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WaveletFilter {
    /// Two-tap Haar filter.
    #[default]
    Haar,
    /// Four-tap Daubechies filter.
    Db2,
}

impl WaveletFilter {
    /// Analysis lowpass taps.
    pub fn lowpass(&self) -> Vec<f64> {
        match self {
            WaveletFilter::Haar => vec![std::f64::consts::FRAC_1_SQRT_2; 2],
            WaveletFilter::Db2 => {
                let s3 = 3f64.sqrt();
                let norm = 4.0 * std::f64::consts::SQRT_2;
                vec![
                    (1.0 + s3) / norm,
                    (3.0 + s3) / norm,
                    (3.0 - s3) / norm,
                    (1.0 - s3) / norm,
                ]
            }
        }
    }

    /// Analysis highpass taps (quadrature mirror of the lowpass).
    pub fn highpass(&self) -> Vec<f64> {
        let h = self.lowpass();
        let n = h.len();
        (0..n)
            .map(|k| if k % 2 == 0 { h[n - 1 - k] } else { -h[n - 1 - k] })
            .collect()
    }

    pub fn taps(&self) -> usize {
        match self {
            WaveletFilter::Haar => 2,
            WaveletFilter::Db2 => 4,
        }
    }
}

impl FromStr for WaveletFilter {
    type Err = InvNetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "haar" => Ok(WaveletFilter::Haar),
            "db2" => Ok(WaveletFilter::Db2),
            other => Err(InvNetError::UnknownPattern(other.to_string())),
        }
    }
}

impl fmt::Display for WaveletFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WaveletFilter::Haar => "haar",
            WaveletFilter::Db2 => "db2",
        })
    }
}

/// Periodic shift so that `out[i] = x[(i + k) mod n]` along `axis`.
fn roll_left(x: &Tensor, k: usize, axis: usize) -> Result<Tensor> {
    let n = x.dims()[axis];
    let k = k % n;
    if k == 0 {
        return Ok(x.clone());
    }
    let head = x.narrow(axis, k, n - k)?;
    let tail = x.narrow(axis, 0, k)?;
    Ok(Tensor::cat(&[&head, &tail], axis)?)
}

/// Periodic shift so that `out[(i + k) mod n] = x[i]` along `axis`.
fn roll_right(x: &Tensor, k: usize, axis: usize) -> Result<Tensor> {
    let n = x.dims()[axis];
    roll_left(x, n - k % n, axis)
}

/// Even-indexed samples along `axis`.
fn even_samples(x: &Tensor, axis: usize) -> Result<Tensor> {
    let mut pairs = x.dims().to_vec();
    let n = pairs[axis];
    pairs[axis] = n / 2;
    pairs.insert(axis + 1, 2);
    Ok(x.reshape(pairs)?.narrow(axis + 1, 0, 1)?.squeeze(axis + 1)?)
}

/// Place `x[i]` at position `2i` along `axis`, zeros at odd positions.
fn upsample(x: &Tensor, axis: usize) -> Result<Tensor> {
    let mut shape = x.dims().to_vec();
    shape[axis] *= 2;
    let zeros = x.zeros_like()?;
    Ok(Tensor::stack(&[x, &zeros], axis + 1)?.reshape(shape)?)
}

fn accumulate(acc: Option<Tensor>, term: Tensor) -> Result<Option<Tensor>> {
    Ok(Some(match acc {
        Some(a) => (a + term)?,
        None => term,
    }))
}

/// One analysis level along `axis`: output is `[low, high]` along that axis.
fn analyze_axis(x: &Tensor, axis: usize, filter: WaveletFilter) -> Result<Tensor> {
    let (h, g) = (filter.lowpass(), filter.highpass());
    let mut low = None;
    let mut high = None;
    for k in 0..filter.taps() {
        let even = even_samples(&roll_left(x, k, axis)?, axis)?;
        low = accumulate(low, (&even * h[k])?)?;
        high = accumulate(high, (&even * g[k])?)?;
    }
    match (low, high) {
        (Some(low), Some(high)) => Ok(Tensor::cat(&[&low, &high], axis)?),
        _ => Ok(x.clone()),
    }
}

/// One synthesis level along `axis`, inverse of [`analyze_axis`].
fn synthesize_axis(y: &Tensor, axis: usize, filter: WaveletFilter) -> Result<Tensor> {
    let (h, g) = (filter.lowpass(), filter.highpass());
    let half = y.dims()[axis] / 2;
    let low = y.narrow(axis, 0, half)?;
    let high = y.narrow(axis, half, half)?;
    let mut x = None;
    for k in 0..filter.taps() {
        let c = ((&low * h[k])? + (&high * g[k])?)?;
        x = accumulate(x, roll_right(&upsample(&c, axis)?, k, axis)?)?;
    }
    Ok(x.unwrap_or_else(|| y.clone()))
}

fn check_taps(spatial: &[usize], filter: WaveletFilter) -> Result<()> {
    let taps = filter.taps();
    if let Some((axis, &size)) = spatial.iter().enumerate().find(|(_, &s)| s < taps) {
        return Err(InvNetError::WaveletTooShort { axis, size, taps });
    }
    Ok(())
}

/// Wavelet decomposition of every spatial axis, packed into channels.
pub fn wavelet_squeeze(x: &Tensor, filter: WaveletFilter) -> Result<Tensor> {
    let spatial = check_even_spatial(x, "wavelet_squeeze")?;
    check_taps(&spatial, filter)?;
    trace!(%filter, ?spatial, "wavelet_squeeze");

    let mut bands = x.clone();
    for axis in 0..spatial.len() {
        bands = analyze_axis(&bands, axis, filter)?;
    }
    squeeze(&bands, Pattern::Patch)
}

/// Inverse of [`wavelet_squeeze`] for the same filter.
pub fn wavelet_unsqueeze(y: &Tensor, filter: WaveletFilter) -> Result<Tensor> {
    check_rank(y, "wavelet_unsqueeze")?;
    let bands = unsqueeze(y, Pattern::Patch)?;
    let spatial = check_even_spatial(&bands, "wavelet_unsqueeze")?;
    check_taps(&spatial, filter)?;
    trace!(%filter, ?spatial, "wavelet_unsqueeze");

    let mut x = bands;
    for axis in (0..spatial.len()).rev() {
        x = synthesize_axis(&x, axis, filter)?;
    }
    Ok(x)
}
