//! Stevedore Core - Foundational Types
//!
//! Error taxonomy, engine configuration and unit parsing shared by the
//! image engine and the RPC gateway.

pub mod config;
pub mod error;
pub mod units;

// Re-export commonly used types
pub use config::{EngineConfig, ImageFormat, LogLevel, PullPolicy};
pub use error::{ImageError, Result};

/// Stevedore version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
