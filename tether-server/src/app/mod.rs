//! The live application the bridge drives
//!
//! The bridge depends on exactly two primitives: invoke a named command with
//! JSON arguments, and evaluate a script in the active view. Everything else
//! about the host is opaque.

mod process;

#[cfg(test)]
pub(crate) mod mock;

pub use process::{HostCommand, ProcessApplication};

use async_trait::async_trait;
use serde_json::Value;

/// Application errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    /// Not started, exited, or its channel broke
    #[error("application unreachable: {0}")]
    Unreachable(String),

    /// The named command reported a failure
    #[error("command {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The script threw or could not be evaluated
    #[error("script failed: {0}")]
    ScriptFailed(String),

    /// The application answered with something we cannot read
    #[error("malformed application reply: {0}")]
    Protocol(String),
}

impl AppError {
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }
}

/// Handle on the single live application instance
///
/// `start` and `stop` are idempotent. Calls made while stopped fail with
/// [`AppError::Unreachable`].
#[async_trait]
pub trait Application: Send + Sync {
    /// Launch or attach to the application
    async fn start(&self) -> Result<(), AppError>;

    /// Tear the application down
    async fn stop(&self) -> Result<(), AppError>;

    /// Invoke a named command with JSON arguments
    async fn invoke(&self, command: &str, args: Value) -> Result<Value, AppError>;

    /// Evaluate a script in the active view and return its value
    async fn evaluate(&self, script: &str) -> Result<Value, AppError>;

    /// Whether calls can currently reach the application
    fn is_running(&self) -> bool;
}
