//! Configuration for the bridge server
//!
//! Values come from `config.toml` in the XDG config directory, overridden by
//! command-line flags in the binary.

mod loader;
mod schema;

pub use loader::ConfigLoader;
pub use schema::*;
