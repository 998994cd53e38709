//! Protocol Stack Layers Library
//!
//! This crate implements the RLC Acknowledged Mode layer (3GPP TS 36.322):
//! segmentation and reassembly, ARQ with STATUS reporting, polling and
//! the per-bearer entity multiplexer.

pub mod rlc;

use thiserror::Error;

pub use rlc::{
    PdcpRlcInterface, RlcBearerMetrics, RlcConfig, RlcEntity, RlcLayer, RrcRlcInterface,
    WriteSduError,
};

/// Common errors for protocol layers
#[derive(Error, Debug)]
pub enum LayerError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}
