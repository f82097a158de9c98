//! Bridge configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Most logical ports a single bridge instance multiplexes
pub const MAX_PORTS: usize = 4;

/// Longest peer channel name the transport accepts
pub const MAX_CHANNEL_NAME: usize = 9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub peer: PeerSettings,
    /// Logical ports, indexed by position
    #[serde(default = "BridgeConfig::default_ports")]
    pub ports: Vec<PortConfig>,
    /// Device-info diagnostic exchange
    #[serde(default)]
    pub diag: DiagSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    pub log_level: String,
    /// Worker threads running relay work
    #[serde(default = "BridgeSettings::default_workers")]
    pub workers: usize,
}

impl BridgeSettings {
    fn default_workers() -> usize {
        2
    }
}

/// Request pool sizing, per port and direction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Requests kept on the OUT (host to peer) side
    #[serde(default = "PoolSettings::default_queue_size")]
    pub rx_queue_size: usize,
    #[serde(default = "PoolSettings::default_buf_size")]
    pub rx_buf_size: usize,
    /// Requests kept on the IN (peer to host) side
    #[serde(default = "PoolSettings::default_queue_size")]
    pub tx_queue_size: usize,
    #[serde(default = "PoolSettings::default_buf_size")]
    pub tx_buf_size: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            rx_queue_size: Self::default_queue_size(),
            rx_buf_size: Self::default_buf_size(),
            tx_queue_size: Self::default_queue_size(),
            tx_buf_size: Self::default_buf_size(),
        }
    }
}

impl PoolSettings {
    fn default_queue_size() -> usize {
        8
    }

    fn default_buf_size() -> usize {
        2048
    }
}

/// Peer channel open policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSettings {
    /// Delay between a channel being announced and the first open attempt
    #[serde(default = "PeerSettings::default_open_delay")]
    pub open_delay_ms: u64,
    /// Delay between open attempts while the channel is not ready
    #[serde(default = "PeerSettings::default_open_retry")]
    pub open_retry_ms: u64,
    /// Give up after this many failed attempts (None = keep trying)
    #[serde(default)]
    pub max_open_retries: Option<u32>,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            open_delay_ms: Self::default_open_delay(),
            open_retry_ms: Self::default_open_retry(),
            max_open_retries: None,
        }
    }
}

impl PeerSettings {
    fn default_open_delay() -> u64 {
        10_000
    }

    fn default_open_retry() -> u64 {
        1_000
    }

    pub fn open_delay(&self) -> Duration {
        Duration::from_millis(self.open_delay_ms)
    }

    pub fn open_retry(&self) -> Duration {
        Duration::from_millis(self.open_retry_ms)
    }
}

/// One logical port: which peer channel and control-mux line it binds to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    pub data_channel: String,
    pub control_channel: u8,
}

impl PortConfig {
    pub fn new(data_channel: impl Into<String>, control_channel: u8) -> Self {
        Self {
            data_channel: data_channel.into(),
            control_channel,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Port whose host traffic is inspected
    #[serde(default)]
    pub port: usize,
    /// Raw partition holding the device-info sector
    #[serde(default)]
    pub device_info_path: Option<PathBuf>,
    #[serde(default = "DiagSettings::default_load_retries")]
    pub load_retries: u32,
    #[serde(default = "DiagSettings::default_retry_interval")]
    pub retry_interval_secs: u64,
}

impl Default for DiagSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 0,
            device_info_path: None,
            load_retries: Self::default_load_retries(),
            retry_interval_secs: Self::default_retry_interval(),
        }
    }
}

impl DiagSettings {
    fn default_load_retries() -> u32 {
        5
    }

    fn default_retry_interval() -> u64 {
        10
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeSettings {
                log_level: "info".to_string(),
                workers: BridgeSettings::default_workers(),
            },
            pool: PoolSettings::default(),
            peer: PeerSettings::default(),
            ports: Self::default_ports(),
            diag: DiagSettings::default(),
        }
    }
}

impl BridgeConfig {
    fn default_ports() -> Vec<PortConfig> {
        vec![
            PortConfig::new("SDIO_DUN", 9),
            PortConfig::new("SDIO_NMEA", 10),
        ]
    }

    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/gser-sdio-bridge/bridge.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("gser-sdio-bridge").join("bridge.toml")
        } else {
            PathBuf::from(".config/gser-sdio-bridge/bridge.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.bridge.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.bridge.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.bridge.workers == 0 {
            return Err(anyhow!("workers must be at least 1"));
        }

        let pool = &self.pool;
        for (name, value) in [
            ("rx_queue_size", pool.rx_queue_size),
            ("rx_buf_size", pool.rx_buf_size),
            ("tx_queue_size", pool.tx_queue_size),
            ("tx_buf_size", pool.tx_buf_size),
        ] {
            if value == 0 {
                return Err(anyhow!("pool.{} must be non-zero", name));
            }
        }

        if self.ports.is_empty() || self.ports.len() > MAX_PORTS {
            return Err(anyhow!(
                "Expected 1 to {} ports, found {}",
                MAX_PORTS,
                self.ports.len()
            ));
        }

        let mut names = HashSet::new();
        for port in &self.ports {
            Self::validate_channel_name(&port.data_channel)?;
            if !names.insert(port.data_channel.as_str()) {
                return Err(anyhow!(
                    "Peer channel '{}' is bound to more than one port",
                    port.data_channel
                ));
            }
        }

        if self.diag.enabled && self.diag.port >= self.ports.len() {
            return Err(anyhow!(
                "diag.port {} is out of range ({} ports)",
                self.diag.port,
                self.ports.len()
            ));
        }

        Ok(())
    }

    fn validate_channel_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(anyhow!("Empty peer channel name"));
        }
        if name.len() > MAX_CHANNEL_NAME {
            return Err(anyhow!(
                "Peer channel name '{}' is longer than {} characters",
                name,
                MAX_CHANNEL_NAME
            ));
        }
        Ok(())
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<BridgeConfig> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    BridgeConfig::load(Some(path_buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.bridge.log_level, "info");
        assert_eq!(config.pool.rx_queue_size, 8);
        assert_eq!(config.pool.tx_buf_size, 2048);
        assert_eq!(config.peer.open_delay_ms, 10_000);
        assert_eq!(config.ports.len(), 2);
        assert_eq!(config.ports[0], PortConfig::new("SDIO_DUN", 9));
        assert_eq!(config.ports[1], PortConfig::new("SDIO_NMEA", 10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = BridgeConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: BridgeConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.bridge.log_level, parsed.bridge.log_level);
        assert_eq!(config.ports, parsed.ports);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = BridgeConfig::default();
        config.bridge.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.bridge.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_channel_names() {
        assert!(BridgeConfig::validate_channel_name("SDIO_DUN").is_ok());
        assert!(BridgeConfig::validate_channel_name("SDIO_NMEA").is_ok());
        assert!(BridgeConfig::validate_channel_name("").is_err());
        assert!(BridgeConfig::validate_channel_name("SDIO_TOOLONG").is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_channels() {
        let mut config = BridgeConfig::default();
        config.ports[1].data_channel = "SDIO_DUN".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_port_count() {
        let mut config = BridgeConfig::default();
        config.ports.clear();
        assert!(config.validate().is_err());

        config.ports = (0..=MAX_PORTS)
            .map(|i| PortConfig::new(format!("CH{}", i), i as u8))
            .collect();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_pool_sizes() {
        let mut config = BridgeConfig::default();
        config.pool.tx_buf_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_diag_port() {
        let mut config = BridgeConfig::default();
        config.diag.enabled = true;
        config.diag.port = 2;
        assert!(config.validate().is_err());
        config.diag.port = 1;
        assert!(config.validate().is_ok());
    }
}
