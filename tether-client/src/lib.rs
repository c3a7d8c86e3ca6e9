//! tether-client: test-harness façade for the automation bridge
//!
//! ```no_run
//! # async fn demo() -> Result<(), tether_client::ClientError> {
//! let client = tether_client::BridgeClient::connect("/tmp/app-mcp-e2e.sock").await?;
//! let html = client.get_dom().await?;
//! assert!(html.contains("<body"));
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```
//!
//! The client never reconnects on its own. A dropped connection fails every
//! pending call with [`ClientError::ConnectionLost`]; call
//! [`BridgeClient::reconnect`] explicitly to continue.

mod client;
mod error;

pub use client::{BridgeClient, DEFAULT_CALL_TIMEOUT};
pub use error::ClientError;

pub use tether_protocol::{ElementAction, ErrorCode, RpcError, ScreenshotResult, ToolInfo};
