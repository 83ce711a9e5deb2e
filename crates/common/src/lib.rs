//! Viralize Common Utilities
//!
//! Shared infrastructure for all Viralize crates:
//! - Error types and result aliases
//! - Media-clock conversions and output frame cadence
//! - Tracing/logging initialization
//! - Configuration loading

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;

pub use clock::*;
pub use config::*;
pub use error::*;
