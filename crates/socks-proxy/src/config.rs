//! Proxy server configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Default number of concurrently served sessions
pub const DEFAULT_POOL_CAPACITY: usize = 1000;

/// Proxy server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listen address
    pub bind_host: IpAddr,

    /// SOCKS5 listen port
    pub port: u16,

    /// Maximum number of sessions handled at once
    pub pool_capacity: usize,

    /// Logging configuration
    pub log_level: String,

    /// Metrics configuration
    pub metrics: MetricsConfig,

    /// Timeout settings
    pub timeouts: TimeoutConfig,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics collection
    pub enabled: bool,

    /// Metrics listen address
    pub bind_address: String,

    /// Metrics path
    pub path: String,
}

/// Timeout configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Destination connect timeout in seconds; unset means no timeout
    pub connect_secs: Option<u64>,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Option<Duration> {
        self.connect_secs.map(Duration::from_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 10080,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            log_level: "info".to_string(),
            metrics: MetricsConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:10081".to_string(),
            path: "/metrics".to_string(),
        }
    }
}

impl ProxyConfig {
    /// Configuration listening on every interface at `port`
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Get SOCKS5 bind address
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.port)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.pool_capacity == 0 {
            return Err(crate::ProxyError::config("pool_capacity must be greater than 0"));
        }
        if self.pool_capacity > Semaphore::MAX_PERMITS {
            return Err(crate::ProxyError::config(format!(
                "pool_capacity must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.metrics.enabled {
            self.metrics
                .bind_address
                .parse::<SocketAddr>()
                .map_err(|e| crate::ProxyError::config(format!("Invalid metrics address: {}", e)))?;
        }
        if self.timeouts.connect_secs == Some(0) {
            return Err(crate::ProxyError::config("timeouts.connect_secs must be greater than 0"));
        }
        Ok(())
    }

    /// Load configuration from file
    pub async fn load_from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::ProxyError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::ProxyError::config(format!("Failed to serialize config: {}", e)))?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}
