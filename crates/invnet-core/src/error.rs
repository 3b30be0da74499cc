//! Centralized error types for invnet.
//!
//! Uses thiserror for ergonomic error handling with context. Shape errors are
//! raised before any output tensor is allocated, so a failed call never leaves
//! a partially written result behind.

use thiserror::Error;

/// Main error type for invnet operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InvNetError {
    /// Tensor rank is not one of the supported layouts (4-D or 5-D).
    #[error("{op}: expected a 4-D or 5-D tensor, got rank {rank}")]
    UnsupportedRank { op: &'static str, rank: usize },

    /// A spatial axis that must be halved has odd extent.
    #[error("{op}: spatial axis {axis} has odd size {size}")]
    OddSpatialDim {
        op: &'static str,
        axis: usize,
        size: usize,
    },

    /// Channel count is not divisible by the factor an unsqueeze requires.
    #[error("{op}: channel count {channels} is not divisible by {factor}")]
    ChannelDivisibility {
        op: &'static str,
        channels: usize,
        factor: usize,
    },

    /// Unrecognised squeeze pattern or wavelet name.
    #[error("unknown pattern '{0}'")]
    UnknownPattern(String),

    /// Default midpoint requested on a zero-length channel axis.
    #[error("{op}: cannot take the midpoint of an empty channel axis")]
    EmptyChannelAxis { op: &'static str },

    /// Explicit split index lies past the end of the channel axis.
    #[error("split index {index} out of range for {channels} channels")]
    SplitOutOfRange { index: usize, channels: usize },

    /// Operand shapes disagree.
    #[error("{op}: shape mismatch, expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Spatial axis shorter than the wavelet filter.
    #[error("wavelet: axis {axis} of size {size} is shorter than the {taps}-tap filter")]
    WaveletTooShort {
        axis: usize,
        size: usize,
        taps: usize,
    },

    /// Recursion reached a level with no coupling block.
    #[error("recursion scale {scale} exceeds coupling depth {depth}")]
    DepthExceeded { scale: usize, depth: usize },

    /// Invalid layer configuration detected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Candle tensor library error.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, InvNetError>;

impl InvNetError {
    /// Check if this is a caller-side shape error (rejected before any write).
    pub fn is_shape_error(&self) -> bool {
        matches!(
            self,
            InvNetError::UnsupportedRank { .. }
                | InvNetError::OddSpatialDim { .. }
                | InvNetError::ChannelDivisibility { .. }
                | InvNetError::UnknownPattern(_)
                | InvNetError::EmptyChannelAxis { .. }
                | InvNetError::SplitOutOfRange { .. }
                | InvNetError::ShapeMismatch { .. }
                | InvNetError::WaveletTooShort { .. }
        )
    }
}

/// Helper for creating config errors.
pub fn config_error(message: impl Into<String>) -> InvNetError {
    InvNetError::InvalidConfig(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InvNetError::OddSpatialDim {
            op: "squeeze",
            axis: 0,
            size: 15,
        };
        assert!(err.to_string().contains("odd size 15"));
        assert!(err.is_shape_error());
    }

    #[test]
    fn test_depth_error_is_not_shape_error() {
        let err = InvNetError::DepthExceeded { scale: 3, depth: 2 };
        assert!(err.to_string().contains("scale 3"));
        assert!(!err.is_shape_error());
    }

    #[test]
    fn test_candle_conversion() {
        let err: InvNetError = candle_core::Error::Msg("boom".to_string()).into();
        assert!(matches!(err, InvNetError::Candle(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_config_error_helper() {
        let err = config_error("n_in must be > 0");
        assert_eq!(err.to_string(), "Invalid configuration: n_in must be > 0");
    }
}
