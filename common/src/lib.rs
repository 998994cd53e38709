//! Common Utilities and Types Library
//!
//! This crate provides shared types, bit-level helpers and the timer
//! facility used across the RLC stack.

pub mod timers;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use timers::{TimerError, TimerHandler, TimerId, UniqueTimer};
pub use types::*;
pub use utils::*;
