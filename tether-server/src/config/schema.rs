//! Configuration schema structs

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_protocol::MAX_FRAME_SIZE;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub bridge: BridgeConfig,
    pub application: ApplicationConfig,
}

/// Socket identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name used to derive the default socket path (default: "app")
    pub app_name: String,
    /// Explicit socket path, overriding the derived one
    pub socket_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            app_name: "app".into(),
            socket_path: None,
        }
    }
}

impl ServerConfig {
    /// Socket path the server binds and clients connect to
    pub fn resolved_socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| tether_utils::default_socket_path(&self.app_name))
    }
}

/// Socket transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Longest accepted frame in bytes (default: 16 MiB)
    pub max_frame_bytes: usize,
    /// Responses buffered per connection before producers wait (default: 256)
    pub send_queue_depth: usize,
    /// Consecutive accept failures before the server gives up (default: 10)
    pub accept_max_failures: u32,
    /// Upper bound on the accept retry delay (default: 1000)
    pub accept_backoff_max_ms: u64,
    /// How long `stop()` waits for connections to drain (default: 2000)
    pub shutdown_grace_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: MAX_FRAME_SIZE,
            send_queue_depth: 256,
            accept_max_failures: 10,
            accept_backoff_max_ms: 1000,
            shutdown_grace_ms: 2000,
        }
    }
}

impl TransportConfig {
    pub fn accept_backoff_max(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_max_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Command bridge policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Per-call application round-trip timeout (default: 5000)
    pub call_timeout_ms: u64,
    /// How long `wait_for_element` polls (default: 3000)
    pub element_wait_timeout_ms: u64,
    /// Delay between element presence checks (default: 100)
    pub element_poll_interval_ms: u64,
    /// Screenshot output directory (default: XDG data dir + "/results")
    pub results_dir: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5000,
            element_wait_timeout_ms: 3000,
            element_poll_interval_ms: 100,
            results_dir: None,
        }
    }
}

impl BridgeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn element_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.element_wait_timeout_ms)
    }

    pub fn element_poll_interval(&self) -> Duration {
        Duration::from_millis(self.element_poll_interval_ms)
    }

    pub fn resolved_results_dir(&self) -> PathBuf {
        self.results_dir
            .clone()
            .unwrap_or_else(tether_utils::results_dir)
    }
}

/// Host process the bridge drives
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Executable to launch; the binary requires one (here or on the CLI)
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Extra environment for the host process
    pub env: HashMap<String, String>,
}
