//! Client and loopback-server configuration.
//!
//! Both structs deserialize from JSON with every field optional:
//! ```text
//! { "server_url": "ws://10.0.0.2:8080", "health_check_interval_secs": 5 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the document server
    pub server_url: String,
    /// Interval of the local connection health check; 0 disables it
    pub health_check_interval_secs: u64,
    /// Capacity of the outbound frame channel
    pub outbound_capacity: usize,
    /// Largest header the framer buffers before giving up on the stream
    pub max_header_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080".to_string(),
            health_check_interval_secs: 3,
            outbound_capacity: 256,
            max_header_bytes: 64 * 1024,
        }
    }
}

impl ClientConfig {
    /// Config for tests: given server, no health check.
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            health_check_interval_secs: 0,
            outbound_capacity: 32,
            max_header_bytes: 4096,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ClientError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(ClientError::Config(format!(
                "server_url must be a ws:// or wss:// url, got \"{}\"",
                self.server_url
            )));
        }
        if self.outbound_capacity == 0 {
            return Err(ClientError::Config("outbound_capacity must be positive".to_string()));
        }
        if self.max_header_bytes < 64 {
            return Err(ClientError::Config("max_header_bytes must be at least 64".to_string()));
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0).then(|| Duration::from_secs(self.health_check_interval_secs))
    }
}

/// Loopback server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Largest block a single read may return
    pub page_size: u64,
    /// Capacity of the notification fan-out channel
    pub broadcast_capacity: usize,
    /// Shared secret; when set, requests before a successful `A` are refused
    pub token: Option<String>,
    /// Maximum files one connection may hold open
    pub max_open_files: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            page_size: 1024,
            broadcast_capacity: 256,
            token: None,
            max_open_files: 10,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, tiny pages so paging is exercised.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            page_size: 8,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ClientError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ClientError::Config(e.to_string()))?;
        if config.page_size == 0 {
            return Err(ClientError::Config("page_size must be positive".to_string()));
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }
}
