//! tether-utils: Common utilities shared across tether crates
//!
//! This crate provides:
//! - Unified error types ([`TetherError`], [`Result`])
//! - Logging infrastructure ([`init_logging`], [`LogConfig`])
//! - XDG-compliant path utilities ([`paths`] module)

pub mod error;
pub mod logging;
pub mod paths;

// Re-export main types at crate root for convenience
pub use error::{Result, TetherError};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogOutput};

// Re-export commonly used path functions
pub use paths::{
    config_dir, config_file, data_dir, default_socket_path, ensure_dir, log_dir, results_dir,
    state_dir,
};
