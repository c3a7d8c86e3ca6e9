//! tether-server: automation bridge for a running desktop application
//!
//! Exposes a catalog of schema-validated tools over a local Unix socket and
//! executes them against the one live application through a serializing
//! command bridge.

pub mod app;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod registry;
pub mod router;
pub mod server;
pub mod tools;
pub mod transport;


pub use app::{AppError, Application, HostCommand, ProcessApplication};
pub use bridge::{Access, BridgeError, CommandBridge};
pub use config::{AppConfig, ConfigLoader};
pub use registry::{RegistryError, ToolDefinition, ToolError, ToolRegistry};
pub use server::{ServerError, ServerInstance};
pub use transport::TransportError;
