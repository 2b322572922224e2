use crate::flow::Transport;
use crate::network::TapConfig;
use crate::tunnel::{TunnelConfig, DEFAULT_DRAIN_BUFFER_SIZE, DEFAULT_QUEUE_CAPACITY};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[allow(clippy::enum_variant_names)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub relay: RelayConfig,

    #[serde(default)]
    pub tap: TapSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    pub target: String,

    #[serde(default = "default_protocol")]
    pub protocol: Transport,

    #[serde(default = "default_amplification")]
    pub amplification: usize,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_drain_buffer")]
    pub drain_buffer_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TapSettings {
    #[serde(default = "default_tap_listen")]
    pub listen: String,

    #[serde(default = "default_tap_buffer")]
    pub read_buffer_size: usize,
}

impl Default for TapSettings {
    fn default() -> Self {
        Self {
            listen: default_tap_listen(),
            read_buffer_size: default_tap_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_protocol() -> Transport {
    Transport::Tcp
}
fn default_amplification() -> usize {
    1
}
fn default_idle_timeout() -> u64 {
    1000
}
fn default_connect_timeout() -> u64 {
    5000
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_drain_buffer() -> usize {
    DEFAULT_DRAIN_BUFFER_SIZE
}
fn default_tap_listen() -> String {
    "127.0.0.1:4000".to_string()
}
fn default_tap_buffer() -> usize {
    65536
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "plain".to_string()
}

impl Config {
    /// Builds a configuration with every default and the given target.
    pub fn default_with_target(target: impl Into<String>) -> Self {
        Self {
            relay: RelayConfig {
                target: target.into(),
                protocol: default_protocol(),
                amplification: default_amplification(),
                idle_timeout_ms: default_idle_timeout(),
                connect_timeout_ms: default_connect_timeout(),
                queue_capacity: default_queue_capacity(),
                drain_buffer_size: default_drain_buffer(),
            },
            tap: TapSettings::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_config(self)
    }
}

impl RelayConfig {
    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            target: self.target.clone(),
            transport: self.protocol,
            amplification: self.amplification,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            queue_capacity: self.queue_capacity,
            drain_buffer_size: self.drain_buffer_size,
        }
    }
}

impl TapSettings {
    pub fn tap_config(&self) -> Result<TapConfig, ConfigError> {
        let bind_addr = parse_listen(&self.listen)?;
        Ok(TapConfig {
            bind_addr,
            read_buffer_size: self.read_buffer_size,
        })
    }
}

fn parse_listen(listen: &str) -> Result<SocketAddr, ConfigError> {
    listen.parse::<SocketAddr>().map_err(|e| {
        ConfigError::ValidationError(format!("Invalid tap listen address '{}': {}", listen, e))
    })
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration
fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let relay = &config.relay;

    if relay.target.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "relay.target must not be empty".to_string(),
        ));
    }
    if !relay.target.contains(':') {
        return Err(ConfigError::ValidationError(format!(
            "relay.target '{}' must be host:port",
            relay.target
        )));
    }
    if relay.amplification == 0 {
        return Err(ConfigError::ValidationError(
            "relay.amplification must be at least 1".to_string(),
        ));
    }
    if relay.idle_timeout_ms == 0 {
        return Err(ConfigError::ValidationError(
            "relay.idle_timeout_ms must be greater than 0".to_string(),
        ));
    }
    if relay.connect_timeout_ms == 0 {
        return Err(ConfigError::ValidationError(
            "relay.connect_timeout_ms must be greater than 0".to_string(),
        ));
    }
    if relay.queue_capacity == 0 {
        return Err(ConfigError::ValidationError(
            "relay.queue_capacity must be at least 1".to_string(),
        ));
    }
    if relay.drain_buffer_size == 0 || config.tap.read_buffer_size == 0 {
        return Err(ConfigError::ValidationError(
            "buffer sizes must be greater than 0".to_string(),
        ));
    }

    parse_listen(&config.tap.listen)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netcopy.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let (_dir, path) = write_config(
            r#"
[relay]
target = "192.168.0.111:80"
"#,
        );

        let config = load_config(&path).unwrap();
        assert_eq!(config.relay.protocol, Transport::Tcp);
        assert_eq!(config.relay.amplification, 1);
        assert_eq!(config.relay.queue_capacity, 10);
        assert_eq!(config.tap.listen, "127.0.0.1:4000");
        assert_eq!(config.logging.format, "plain");

        let tunnel = config.relay.tunnel_config();
        assert_eq!(tunnel.idle_timeout, Duration::from_secs(1));
        assert_eq!(tunnel.target, "192.168.0.111:80");
    }

    #[test]
    fn test_full_config() {
        let (_dir, path) = write_config(
            r#"
[relay]
target = "example.com:53"
protocol = "udp"
amplification = 3
idle_timeout_ms = 2500
connect_timeout_ms = 100
queue_capacity = 4
drain_buffer_size = 2048

[tap]
listen = "0.0.0.0:7000"
read_buffer_size = 4096

[logging]
level = "debug"
format = "json"
"#,
        );

        let config = load_config(&path).unwrap();
        let tunnel = config.relay.tunnel_config();
        assert_eq!(tunnel.transport, Transport::Udp);
        assert_eq!(tunnel.amplification, 3);
        assert_eq!(tunnel.idle_timeout, Duration::from_millis(2500));
        assert_eq!(tunnel.queue_capacity, 4);

        let tap = config.tap.tap_config().unwrap();
        assert_eq!(tap.bind_addr, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(tap.read_buffer_size, 4096);
    }

    #[test]
    fn test_zero_amplification_rejected() {
        let (_dir, path) = write_config(
            r#"
[relay]
target = "127.0.0.1:80"
amplification = 0
"#,
        );

        assert!(matches!(
            load_config(&path),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_missing_target_rejected() {
        let (_dir, path) = write_config("[relay]\nprotocol = \"tcp\"\n");
        assert!(matches!(load_config(&path), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_invalid_tap_address_rejected() {
        let mut config = Config::default_with_target("127.0.0.1:80");
        config.tap.listen = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let (_dir, path) = write_config(
            r#"
[relay]
target = "127.0.0.1:80"
protocol = "sctp"
"#,
        );
        assert!(matches!(load_config(&path), Err(ConfigError::ParseError(_))));
    }
}
