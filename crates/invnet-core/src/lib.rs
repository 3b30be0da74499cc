//! Core types shared across invnet crates.
//!
//! Provides:
//! - Centralized error types via thiserror
//! - HINT layer configuration with TOML support
//! - Structured logging setup via tracing

pub mod config;
pub mod error;
pub mod logging;

pub use config::{get_depth, HintConfig, KernelConfig, PermuteKind};
pub use error::{config_error, InvNetError, Result};
