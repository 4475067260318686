use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{ChatError, Result};
use crate::protocol::{DEFAULT_MAX_FRAME_SIZE, HEADER_LEN, MAX_PAYLOAD_DECODE};

/// Session configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Name announced in the handshake
    pub identity: String,
    pub listen_host: String,
    pub listen_port: u16,
    /// Files offered to peers are read from here
    pub shared_dir: PathBuf,
    /// Completed inbound files land here
    pub downloads_dir: PathBuf,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Connection-level timing and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub handshake_timeout_ms: u64,
    /// Send PING after this much outbound and inbound silence
    pub heartbeat_interval_ms: u64,
    /// Close the connection after this much inbound silence
    pub liveness_timeout_ms: u64,
    pub outbound_queue_capacity: usize,
    pub max_frame_size: u32,
    pub shutdown_timeout_ms: u64,
    pub max_connections: usize,
}

/// File transfer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: u32,
    /// Chunks that may be buffered ahead of the next expected sequence
    pub reorder_window: u64,
    /// Applies to our offers awaiting the peer and to the peer's offers
    /// awaiting us
    pub offer_timeout_ms: u64,
    /// Non-terminal incoming transfers allowed per connection
    pub max_incoming_per_peer: usize,
    /// Accept every offer without asking the caller
    pub auto_accept: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            heartbeat_interval_ms: 15_000,
            liveness_timeout_ms: 45_000,
            outbound_queue_capacity: 64,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            shutdown_timeout_ms: 5_000,
            max_connections: 64,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024, // 64KB chunks
            reorder_window: 32,
            offer_timeout_ms: 60_000,
            max_incoming_per_peer: 16,
            auto_accept: false,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity: "anonymous".to_string(),
            listen_host: "0.0.0.0".to_string(),
            listen_port: 5001,
            shared_dir: PathBuf::from("./shared"),
            downloads_dir: PathBuf::from("./downloads"),
            network: NetworkConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl TransferConfig {
    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }
}

impl SessionConfig {
    pub fn new(
        identity: impl Into<String>,
        listen_host: impl Into<String>,
        listen_port: u16,
        shared_dir: impl Into<PathBuf>,
        downloads_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            identity: identity.into(),
            listen_host: listen_host.into(),
            listen_port,
            shared_dir: shared_dir.into(),
            downloads_dir: downloads_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from file or create default
    pub fn load_or_default(config_path: Option<&Path>) -> Self {
        if let Some(config) = config_path
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|content| serde_json::from_str(&content).ok())
        {
            return config;
        }
        Self::default()
    }

    /// Load configuration from a file, reporting why it could not be used
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path).map_err(|e| {
            ChatError::Config(format!("cannot read {}: {}", config_path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ChatError::Config(format!("cannot parse {}: {}", config_path.display(), e))
        })
    }

    /// Save configuration to file
    pub fn save_to_file(&self, config_path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ChatError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.identity.trim().is_empty() {
            return Err(ChatError::Config("identity must not be empty".into()));
        }
        if self.network.handshake_timeout_ms == 0 {
            return Err(ChatError::Config("handshake timeout must be greater than 0".into()));
        }
        if self.network.heartbeat_interval_ms == 0
            || self.network.heartbeat_interval_ms >= self.network.liveness_timeout_ms
        {
            return Err(ChatError::Config(
                "heartbeat interval must be non-zero and shorter than the liveness timeout".into(),
            ));
        }
        if self.network.outbound_queue_capacity == 0 {
            return Err(ChatError::Config("outbound queue capacity must be greater than 0".into()));
        }
        if self.network.max_frame_size as usize > MAX_PAYLOAD_DECODE {
            return Err(ChatError::Config(format!(
                "max frame size {} exceeds the {} byte payload ceiling",
                self.network.max_frame_size, MAX_PAYLOAD_DECODE
            )));
        }
        if self.network.max_connections == 0 {
            return Err(ChatError::Config("max connections must be greater than 0".into()));
        }
        if self.transfer.chunk_size == 0 {
            return Err(ChatError::Config("chunk size must be greater than 0".into()));
        }
        // Chunk data plus its id and sequence must fit in one frame.
        let chunk_frame = self.transfer.chunk_size as u64 + 256 + HEADER_LEN as u64;
        if chunk_frame > self.network.max_frame_size as u64 {
            return Err(ChatError::Config(format!(
                "chunk size {} does not fit in a {} byte frame",
                self.transfer.chunk_size, self.network.max_frame_size
            )));
        }
        if self.transfer.reorder_window == 0 {
            return Err(ChatError::Config("reorder window must be greater than 0".into()));
        }
        if self.transfer.max_incoming_per_peer == 0 {
            return Err(ChatError::Config(
                "max incoming transfers per peer must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// The shared and downloads directories must already exist
    pub fn validate_directories(&self) -> Result<()> {
        for (label, dir) in [("shared", &self.shared_dir), ("downloads", &self.downloads_dir)] {
            if !dir.is_dir() {
                return Err(ChatError::Config(format!(
                    "{} directory {} does not exist",
                    label,
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        config.validate().expect("Default config should be valid");
        assert_eq!(config.transfer.chunk_size, 64 * 1024);
        assert_eq!(config.network.heartbeat_interval(), Duration::from_secs(15));
        assert_eq!(config.network.liveness_timeout(), Duration::from_secs(45));
    }

    #[test]
    fn test_config_serialization() {
        let config = SessionConfig::default();
        let json = serde_json::to_string(&config).expect("Should serialize");
        let decoded: SessionConfig = serde_json::from_str(&json).expect("Should deserialize");
        assert_eq!(decoded.identity, config.identity);
        assert_eq!(decoded.network.max_frame_size, config.network.max_frame_size);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "identity": "alice",
            "listen_host": "127.0.0.1",
            "listen_port": 6000,
            "shared_dir": "/tmp/shared",
            "downloads_dir": "/tmp/downloads",
            "transfer": { "auto_accept": true }
        }"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();
        assert!(config.transfer.auto_accept);
        assert_eq!(config.transfer.chunk_size, 64 * 1024);
        assert_eq!(config.network.handshake_timeout_ms, 5_000);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = SessionConfig::default();
        config.identity = "  ".into();
        assert!(matches!(config.validate(), Err(ChatError::Config(_))));

        let mut config = SessionConfig::default();
        config.network.heartbeat_interval_ms = config.network.liveness_timeout_ms;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.network.max_frame_size = 1024;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_directories_are_config_errors() {
        let config = SessionConfig::new(
            "alice",
            "127.0.0.1",
            0,
            "/definitely/not/here/shared",
            "/definitely/not/here/downloads",
        );
        assert!(matches!(config.validate_directories(), Err(ChatError::Config(_))));
    }
}
