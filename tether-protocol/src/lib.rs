//! tether-protocol: Wire definitions for the automation bridge
//!
//! This crate defines the request/response envelopes, the stable error
//! taxonomy, the built-in tool parameter types and the newline-delimited
//! JSON codec shared by the bridge server and the client library.

pub mod codec;
pub mod messages;
pub mod types;

// Re-export main types at crate root
pub use codec::{ClientCodec, CodecError, Frame, FrameError, ServerCodec, MAX_FRAME_SIZE};
pub use messages::{ErrorCode, RequestEnvelope, RequestId, ResponseEnvelope, ResponsePayload, RpcError};
pub use types::{
    ElementAction, ElementPosition, MouseButton, ScreenshotResult, StorageAction, ToolCall,
    ToolCallError, ToolInfo,
};

/// Protocol tag carried by every envelope
pub const PROTOCOL_TAG: &str = "tether/1";

/// Reserved method names handled by the router itself
pub mod methods {
    /// Discovery: returns `[{name, description, inputSchema}]`
    pub const TOOLS_LIST: &str = "tools/list";
    /// MCP-style indirection: `{name, arguments}` onto the tool path
    pub const TOOLS_CALL: &str = "tools/call";
    /// Cheap liveness probe
    pub const PING: &str = "ping";

    /// Whether a method name is reserved (tools may not use it)
    pub fn is_reserved(name: &str) -> bool {
        matches!(name, TOOLS_LIST | TOOLS_CALL | PING)
    }
}
