//! # Error Handling
//!
//! Error handling for the Edgeplane control plane.

pub mod types;

pub use types::{EdgeplaneError, Result};

/// Short alias used across the crate
pub type Error = EdgeplaneError;
