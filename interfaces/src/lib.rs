//! Link Emulation Interfaces Library
//!
//! This crate provides the emulated radio link between two RLC peers and
//! the PDU trace written while PDUs cross it.

pub mod link;
pub mod trace;

use thiserror::Error;

pub use link::{LinkConfig, LinkOutcome, LinkStats, RadioLink};
pub use trace::{PduTrace, TraceWriter};

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
