//! Common Utilities and Types Library
//!
//! This crate provides shared types and utilities used across the eNodeB MAC implementation.

pub mod mask;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use mask::{LengthRule, ResourceMask, UnitRange};
pub use types::*;
pub use utils::*;
