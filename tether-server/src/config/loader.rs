//! Configuration loader

use std::path::Path;

use tether_utils::{config_file, Result, TetherError};

use super::AppConfig;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from default location
    pub fn load() -> Result<AppConfig> {
        let path = config_file();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(AppConfig::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<AppConfig> {
        if !path.exists() {
            return Err(TetherError::ConfigNotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|e| TetherError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<AppConfig> {
        toml::from_str(content).map_err(|e| TetherError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &AppConfig) -> Result<()> {
        if config.server.app_name.trim().is_empty() {
            return Err(TetherError::config("app_name must not be empty"));
        }

        let transport = &config.transport;
        if transport.max_frame_bytes == 0 {
            return Err(TetherError::config("max_frame_bytes must be greater than 0"));
        }
        if transport.send_queue_depth == 0 {
            return Err(TetherError::config("send_queue_depth must be greater than 0"));
        }
        if transport.accept_max_failures == 0 {
            return Err(TetherError::config(
                "accept_max_failures must be greater than 0",
            ));
        }

        let bridge = &config.bridge;
        if bridge.call_timeout_ms == 0 {
            return Err(TetherError::config("call_timeout_ms must be greater than 0"));
        }
        if bridge.element_wait_timeout_ms == 0 {
            return Err(TetherError::config(
                "element_wait_timeout_ms must be greater than 0",
            ));
        }
        if bridge.element_poll_interval_ms == 0
            || bridge.element_poll_interval_ms >= bridge.element_wait_timeout_ms
        {
            return Err(TetherError::config(
                "element_poll_interval_ms must be between 1 and element_wait_timeout_ms",
            ));
        }

        Ok(())
    }

    /// Load and validate
    pub fn load_and_validate() -> Result<AppConfig> {
        let config = Self::load()?;
        Self::validate(&config)?;
        Ok(config)
    }
}
