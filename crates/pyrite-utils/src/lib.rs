//! # Pyrite Utilities
//!
//! Shared logging and configuration for the Pyrite workspace.

pub mod config;
pub mod logging;

pub use config::{ConfigError, InspectorConfig};
// Re-export commonly used logging functions for convenience
pub use logging::{init_logging, init_logging_with_level, LogFormat, LogLevel, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
