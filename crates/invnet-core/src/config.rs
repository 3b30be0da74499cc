//! HINT layer configuration with TOML support.
//!
//! Provides the construction parameters for a recursive coupling layer with
//! load/save and validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{config_error, InvNetError, Result};

/// Channel permutation applied at the outermost recursion level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermuteKind {
    /// No permutation.
    #[default]
    None,
    /// Half-width permutation of the second half after the split.
    Lower,
    /// Full-width permutation of the whole input before the split.
    Full,
}

impl FromStr for PermuteKind {
    type Err = InvNetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(PermuteKind::None),
            "lower" => Ok(PermuteKind::Lower),
            "full" => Ok(PermuteKind::Full),
            other => Err(InvNetError::UnknownPattern(other.to_string())),
        }
    }
}

impl fmt::Display for PermuteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PermuteKind::None => "none",
            PermuteKind::Lower => "lower",
            PermuteKind::Full => "full",
        };
        f.write_str(name)
    }
}

/// Convolution hyperparameters of the residual block inside each coupling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Kernel size of the outer convolutions.
    pub k1: usize,
    /// Kernel size of the middle convolution.
    pub k2: usize,
    /// Padding of the outer convolutions.
    pub p1: usize,
    /// Padding of the middle convolution.
    pub p2: usize,
    /// Stride of the outer convolutions.
    pub s1: usize,
    /// Stride of the middle convolution.
    pub s2: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            k1: 3,
            k2: 3,
            p1: 1,
            p2: 1,
            s1: 1,
            s2: 1,
        }
    }
}

impl KernelConfig {
    /// Output extent of a convolution over an axis of length `n`.
    fn conv_extent(n: usize, k: usize, p: usize, s: usize) -> Option<usize> {
        let padded = n + 2 * p;
        if s == 0 || padded < k || (padded - k) % s != 0 {
            return None;
        }
        Some((padded - k) / s + 1)
    }

    /// Check that both convolution settings map an axis of length `n` onto itself.
    pub fn preserves_extent(&self, n: usize) -> bool {
        Self::conv_extent(n, self.k1, self.p1, self.s1) == Some(n)
            && Self::conv_extent(n, self.k2, self.p2, self.s2) == Some(n)
    }
}

/// Number of coupling blocks a HINT layer needs for `n_in` channels.
///
/// Halves the running channel count while it exceeds 4, counting halvings,
/// then adds one.
pub fn get_depth(n_in: usize) -> usize {
    let mut count = 0;
    let mut nc = n_in as f64;
    while nc > 4.0 {
        nc /= 2.0;
        count += 1;
    }
    count + 1
}

/// Construction parameters of a recursive HINT coupling layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HintConfig {
    /// Spatial extents (2 entries for 4-D tensors, 3 for 5-D).
    pub spatial: Vec<usize>,
    /// Number of input channels.
    pub n_in: usize,
    /// Hidden channels of each residual block.
    pub n_hidden: usize,
    /// Batch size the layer is built for.
    pub batch_size: usize,
    /// Channel permutation mode.
    #[serde(default)]
    pub permute: PermuteKind,
    /// Track the log-determinant of the Jacobian.
    #[serde(default = "default_logdet")]
    pub logdet: bool,
    /// Residual block convolution settings.
    #[serde(default)]
    pub kernel: KernelConfig,
    /// Evaluate the two recursion subtrees of forward on the rayon pool.
    #[serde(default)]
    pub parallel_branches: bool,
    /// Seed for parameter initialisation (random when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

fn default_logdet() -> bool {
    true
}

impl Default for HintConfig {
    fn default() -> Self {
        Self {
            spatial: vec![16, 16],
            n_in: 8,
            n_hidden: 16,
            batch_size: 2,
            permute: PermuteKind::None,
            logdet: default_logdet(),
            kernel: KernelConfig::default(),
            parallel_branches: false,
            seed: None,
        }
    }
}

impl HintConfig {
    /// Create a 2-D spatial config with default kernel settings.
    pub fn new(spatial: &[usize], n_in: usize, n_hidden: usize, batch_size: usize) -> Self {
        Self {
            spatial: spatial.to_vec(),
            n_in,
            n_hidden,
            batch_size,
            ..Default::default()
        }
    }

    /// Set the permutation mode.
    pub fn with_permute(mut self, permute: PermuteKind) -> Self {
        self.permute = permute;
        self
    }

    /// Enable or disable log-determinant tracking.
    pub fn with_logdet(mut self, logdet: bool) -> Self {
        self.logdet = logdet;
        self
    }

    /// Fix the initialisation seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Number of coupling blocks in the layer.
    pub fn depth(&self) -> usize {
        get_depth(self.n_in)
    }

    /// Input channel width of coupling block `j` (1-based).
    pub fn block_width(&self, j: usize) -> usize {
        self.n_in >> j
    }

    /// Expected tensor rank (spatial axes plus channel and batch).
    pub fn rank(&self) -> usize {
        self.spatial.len() + 2
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.spatial.len(), 2 | 3) {
            return Err(config_error(format!(
                "spatial must have 2 or 3 entries, got {}",
                self.spatial.len()
            )));
        }
        if let Some((axis, &size)) = self
            .spatial
            .iter()
            .enumerate()
            .find(|(_, &s)| s == 0 || s % 2 != 0)
        {
            return Err(config_error(format!(
                "spatial axis {axis} must be positive and even, got {size}"
            )));
        }
        if self.n_in == 0 {
            return Err(config_error("n_in must be > 0"));
        }
        if self.n_hidden == 0 {
            return Err(config_error("n_hidden must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(config_error("batch_size must be > 0"));
        }
        let depth = self.depth();
        let factor = 1usize << depth;
        if self.n_in % factor != 0 {
            return Err(config_error(format!(
                "n_in={} must be divisible by 2^depth={} (depth {})",
                self.n_in, factor, depth
            )));
        }
        if let Some(&size) = self
            .spatial
            .iter()
            .find(|&&s| !self.kernel.preserves_extent(s))
        {
            return Err(config_error(format!(
                "kernel {:?} does not preserve spatial extent {}",
                self.kernel, size
            )));
        }
        Ok(())
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}
