//! Configuration Types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::connection::types::{
    TlsMethod, DEFAULT_CIPHER, DEFAULT_MAX_BUFFER_THRESHOLD, DEFAULT_TIMEOUT_SECS,
};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub manager: ManagerConfig,
    pub socket: SocketConfig,
    pub rate: RateConfig,
    pub tls: TlsConfig,
    pub listener: ListenerConfig,
    pub logging: LoggingConfig,
}

/// Connection manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Longest wait of one readiness poll
    #[serde(with = "humantime_serde")]
    pub select_timeout: Duration,
    /// How often idle-timeout counters are advanced
    #[serde(with = "humantime_serde")]
    pub timeout_check_interval: Duration,
}

/// Per-connection socket behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Idle timeout, whole seconds; zero disables it
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    pub blocking: bool,
    pub line_mode: bool,
    /// Line buffer size that triggers the overflow event; zero disables it
    pub max_buffer_threshold: usize,
}

/// Write-rate shaping: at most `max_bytes` per `window`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RateConfig {
    pub max_bytes: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

/// Transport encryption configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// PEM file holding the certificate chain and the private key
    pub pem_file: Option<PathBuf>,
    pub pem_password: Option<String>,
    pub cipher: String,
    pub require_client_cert: bool,
    pub method: TlsMethod,
    /// Trust roots for verifying servers; absent means accept any certificate
    pub ca_file: Option<PathBuf>,
}

/// Listening socket configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub port: u16,
    pub bind_host: Option<String>,
    pub backlog: u32,
    pub name: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            select_timeout: Duration::from_millis(100),
            timeout_check_interval: Duration::from_secs(1),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS as u64),
            blocking: false,
            line_mode: false,
            max_buffer_threshold: DEFAULT_MAX_BUFFER_THRESHOLD,
        }
    }
}

impl RateConfig {
    /// Shaping is active only with a positive quota and window
    pub fn is_enabled(&self) -> bool {
        self.max_bytes > 0 && !self.window.is_zero()
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pem_file: None,
            pem_password: None,
            cipher: DEFAULT_CIPHER.to_string(),
            require_client_cert: false,
            method: TlsMethod::Flexible,
            ca_file: None,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: 6667,
            bind_host: None,
            backlog: 128,
            name: "listener".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
