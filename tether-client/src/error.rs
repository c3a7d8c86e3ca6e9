//! Client-side errors
//!
//! These are raised locally and never sent over the wire. Server-reported
//! failures arrive as [`ClientError::Rpc`].

use std::path::PathBuf;
use std::time::Duration;

use tether_protocol::{CodecError, RpcError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("server not running at {}", .path.display())]
    ServerNotRunning { path: PathBuf },

    #[error("failed to connect: {0}")]
    Connect(#[source] std::io::Error),

    #[error("not connected")]
    NotConnected,

    /// No response within the call timeout; the call may still be running
    #[error("{method} timed out after {}ms", .after.as_millis())]
    Timeout { method: String, after: Duration },

    #[error("connection lost")]
    ConnectionLost,

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl ClientError {
    /// Bridge `reason` discriminator, for `ServerError` responses
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Rpc(err) => err.reason(),
            _ => None,
        }
    }

    /// Whether the caller may reasonably retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
