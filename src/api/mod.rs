//! API module
//!
//! This module provides the command surface the presentation layer calls into.

pub mod core;

// Re-export commonly used types
pub use self::core::{Core, CoreError};
