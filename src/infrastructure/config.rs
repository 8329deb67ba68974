use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::error::ConfigError;

/// Application configuration structure
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub chunker: ChunkerConfig,
    pub reassembler: ReassemblerConfig,
    pub negotiation: NegotiationConfig,
    pub orchestrator: OrchestratorConfig,
}

/// Peer connection lifecycle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub exponential_backoff: bool,
    pub backoff_multiplier: f64,
    pub max_retry_delay_ms: u64,
    /// Zero disables the connection timeout
    pub connection_timeout_ms: u64,
    /// Zero disables the heartbeat
    pub heartbeat_interval_ms: u64,
}

/// Sender-side chunking settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    pub chunk_size: usize,
    pub max_chunk_size: usize,
    pub enable_checksum_validation: bool,
}

/// Receiver-side buffering limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblerConfig {
    pub max_file_size: u64,
    /// Largest chunk size a peer may announce
    pub max_chunk_size: u64,
    pub max_memory_usage: u64,
    pub enable_checksum_validation: bool,
    pub stale_timeout_ms: u64,
    pub cleanup_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub request_timeout_ms: u64,
    pub max_concurrent_transfers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Files strictly larger than this go through the swarm path
    pub swarm_threshold: u64,
    pub terminal_grace_ms: u64,
    pub swarm_poll_interval_ms: u64,
    /// Optional delay between chunk sends
    pub chunk_pacing_ms: u64,
    pub auto_accept: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            exponential_backoff: true,
            backoff_multiplier: 2.0,
            max_retry_delay_ms: 30_000,
            connection_timeout_ms: 30_000,
            heartbeat_interval_ms: 15_000,
        }
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            max_chunk_size: 256 * 1024,
            enable_checksum_validation: true,
        }
    }
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            max_file_size: 2 * 1024 * 1024 * 1024, // 2GB
            max_chunk_size: 1024 * 1024,
            max_memory_usage: 512 * 1024 * 1024,
            enable_checksum_validation: true,
            stale_timeout_ms: 5 * 60 * 1000,
            cleanup_interval_ms: 60_000,
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 60_000,
            max_concurrent_transfers: 5,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            swarm_threshold: 20 * 1024 * 1024, // 20MB
            terminal_grace_ms: 5_000,
            swarm_poll_interval_ms: 500,
            chunk_pacing_ms: 0,
            auto_accept: false,
        }
    }
}

impl ReassemblerConfig {
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

impl NegotiationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl OrchestratorConfig {
    pub fn terminal_grace(&self) -> Duration {
        Duration::from_millis(self.terminal_grace_ms)
    }

    pub fn swarm_poll_interval(&self) -> Duration {
        Duration::from_millis(self.swarm_poll_interval_ms)
    }

    pub fn chunk_pacing(&self) -> Option<Duration> {
        (self.chunk_pacing_ms > 0).then(|| Duration::from_millis(self.chunk_pacing_ms))
    }
}

impl AppConfig {
    /// Load configuration from file or create default
    pub fn load_or_default(config_path: Option<&Path>) -> Self {
        let Some(path) = config_path else {
            return Self::default();
        };
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), "Using default configuration: {}", e);
                Self::default()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    /// Apply `PEERCLIP_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, "PEERCLIP_CHUNK_SIZE", &mut self.chunker.chunk_size)?;
        override_from(&lookup, "PEERCLIP_MAX_CHUNK_SIZE", &mut self.chunker.max_chunk_size)?;
        override_from(&lookup, "PEERCLIP_SWARM_THRESHOLD", &mut self.orchestrator.swarm_threshold)?;
        override_from(&lookup, "PEERCLIP_MAX_RETRIES", &mut self.connection.max_retries)?;
        override_from(&lookup, "PEERCLIP_RETRY_DELAY_MS", &mut self.connection.retry_delay_ms)?;
        override_from(
            &lookup,
            "PEERCLIP_CONNECTION_TIMEOUT_MS",
            &mut self.connection.connection_timeout_ms,
        )?;
        override_from(
            &lookup,
            "PEERCLIP_REQUEST_TIMEOUT_MS",
            &mut self.negotiation.request_timeout_ms,
        )?;
        override_from(&lookup, "PEERCLIP_MAX_FILE_SIZE", &mut self.reassembler.max_file_size)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunker.chunk_size == 0 {
            return Err(ConfigError::Invalid("Chunk size must be greater than 0".into()));
        }

        if self.chunker.chunk_size > self.chunker.max_chunk_size {
            return Err(ConfigError::Invalid(format!(
                "Chunk size {} exceeds maximum chunk size {}",
                self.chunker.chunk_size, self.chunker.max_chunk_size
            )));
        }

        if self.chunker.chunk_size as u64 > self.reassembler.max_chunk_size {
            return Err(ConfigError::Invalid(format!(
                "Chunk size {} exceeds the receiving limit of {}",
                self.chunker.chunk_size, self.reassembler.max_chunk_size
            )));
        }

        if self.negotiation.max_concurrent_transfers == 0 {
            return Err(ConfigError::Invalid(
                "Max concurrent transfers must be greater than 0".into(),
            ));
        }

        let multiplier = self.connection.backoff_multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return Err(ConfigError::Invalid("Backoff multiplier must be at least 1".into()));
        }

        Ok(())
    }
}

fn override_from<T, F>(lookup: &F, name: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(name) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { name, value })?;
        debug!(name, "Applied configuration override");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        config.validate().expect("Default config should be valid");
        assert_eq!(config.chunker.chunk_size, 65536);
        assert_eq!(config.orchestrator.swarm_threshold, 20 * 1024 * 1024);
        assert_eq!(config.connection.max_retries, 3);
    }

    #[test]
    fn test_config_serialization() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).expect("Should serialize");
        let deserialized: AppConfig = serde_json::from_str(&json).expect("Should deserialize");
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: AppConfig = serde_json::from_str(r#"{"chunker":{"chunk_size":1024}}"#).unwrap();
        assert_eq!(config.chunker.chunk_size, 1024);
        assert_eq!(config.chunker.max_chunk_size, 256 * 1024);
        assert_eq!(config.connection, ConnectionConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peerclip.json");
        let mut config = AppConfig::default();
        config.orchestrator.auto_accept = true;
        config.save_to_file(&path).unwrap();
        assert_eq!(AppConfig::load_or_default(Some(&path)), config);
        assert_eq!(
            AppConfig::load_or_default(Some(&dir.path().join("missing.json"))),
            AppConfig::default()
        );
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PEERCLIP_CHUNK_SIZE", "131072"),
            ("PEERCLIP_SWARM_THRESHOLD", "1000"),
            ("PEERCLIP_MAX_RETRIES", "7"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        config
            .apply_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.chunker.chunk_size, 131072);
        assert_eq!(config.orchestrator.swarm_threshold, 1000);
        assert_eq!(config.connection.max_retries, 7);
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = AppConfig::default();
        let err = config
            .apply_vars(|name| (name == "PEERCLIP_MAX_RETRIES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { name: "PEERCLIP_MAX_RETRIES", .. }));
    }

    #[test]
    fn test_validation_rejects_oversized_chunks() {
        let mut config = AppConfig::default();
        config.chunker.chunk_size = config.chunker.max_chunk_size + 1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.connection.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.negotiation.max_concurrent_transfers = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.reassembler.max_chunk_size = 1024;
        assert!(config.validate().is_err());
    }
}
