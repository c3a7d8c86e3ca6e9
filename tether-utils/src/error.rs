//! Error types for tether
//!
//! Provides a unified error type for process-level setup shared by the
//! tether crates (configuration, logging, paths, startup).

use std::path::PathBuf;

/// Main error type for tether setup and lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    // === IO Errors ===

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    // === Connection Errors ===

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Server not running at {path}")]
    ServerNotRunning { path: PathBuf },

    #[error("Failed to bind socket {path}: {message}")]
    Bind { path: PathBuf, message: String },

    // === Configuration Errors ===

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    // === Application Errors ===

    #[error("Application error: {0}")]
    Application(String),

    // === Internal Errors ===

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TetherError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an application error
    pub fn application(msg: impl Into<String>) -> Self {
        Self::Application(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::ServerNotRunning { .. })
    }
}

/// Result type alias using TetherError
pub type Result<T> = std::result::Result<T, TetherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TetherError::config("call_timeout_ms must be non-zero");
        assert_eq!(
            err.to_string(),
            "Configuration error: call_timeout_ms must be non-zero"
        );
    }

    #[test]
    fn test_error_display_bind() {
        let err = TetherError::Bind {
            path: PathBuf::from("/tmp/app-mcp-e2e.sock"),
            message: "address in use".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Failed to bind socket"));
        assert!(msg.contains("/tmp/app-mcp-e2e.sock"));
    }

    #[test]
    fn test_error_display_server_not_running() {
        let err = TetherError::ServerNotRunning {
            path: PathBuf::from("/tmp/app-mcp-e2e.sock"),
        };
        assert!(err.to_string().contains("Server not running"));
    }

    #[test]
    fn test_retryable() {
        assert!(TetherError::connection("refused").is_retryable());
        assert!(!TetherError::config("bad").is_retryable());
        assert!(!TetherError::internal("boom").is_retryable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let err: TetherError = io_err.into();
        assert!(matches!(err, TetherError::Io(_)));
    }
}
