//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::path::{Path, PathBuf};

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Override fields from `SOCKMUX_*` variables looked up through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("SOCKMUX_PORT") {
            self.listener.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid SOCKMUX_PORT: {}", port))?;
        }

        if let Some(bind_host) = lookup("SOCKMUX_BIND_HOST") {
            self.listener.bind_host = Some(bind_host);
        }

        if let Some(timeout) = lookup("SOCKMUX_IDLE_TIMEOUT") {
            self.socket.idle_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid SOCKMUX_IDLE_TIMEOUT: {}", timeout))?;
        }

        if let Some(wait) = lookup("SOCKMUX_SELECT_TIMEOUT") {
            self.manager.select_timeout = humantime::parse_duration(&wait)
                .with_context(|| format!("Invalid SOCKMUX_SELECT_TIMEOUT: {}", wait))?;
        }

        if let Some(max_bytes) = lookup("SOCKMUX_RATE_BYTES") {
            self.rate.max_bytes = max_bytes
                .parse::<u32>()
                .with_context(|| format!("Invalid SOCKMUX_RATE_BYTES: {}", max_bytes))?;
        }

        if let Some(window) = lookup("SOCKMUX_RATE_WINDOW") {
            self.rate.window = humantime::parse_duration(&window)
                .with_context(|| format!("Invalid SOCKMUX_RATE_WINDOW: {}", window))?;
        }

        if let Some(enabled) = lookup("SOCKMUX_TLS_ENABLED") {
            self.tls.enabled = enabled
                .parse::<bool>()
                .with_context(|| format!("Invalid SOCKMUX_TLS_ENABLED: {}", enabled))?;
        }

        if let Some(pem_file) = lookup("SOCKMUX_PEM_FILE") {
            self.tls.pem_file = Some(PathBuf::from(pem_file));
        }

        if let Some(log_level) = lookup("SOCKMUX_LOG_LEVEL") {
            self.logging.level = log_level;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_manager_config()
            .with_context(|| "Manager configuration validation failed")?;

        self.validate_socket_config()
            .with_context(|| "Socket configuration validation failed")?;

        self.validate_rate_config()
            .with_context(|| "Rate configuration validation failed")?;

        self.validate_tls_config()
            .with_context(|| "TLS configuration validation failed")?;

        self.validate_listener_config()
            .with_context(|| "Listener configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_manager_config(&self) -> Result<()> {
        if self.manager.select_timeout.as_secs() > 60 {
            bail!("manager.select_timeout cannot exceed 60 seconds");
        }

        if self.manager.timeout_check_interval.is_zero() {
            bail!("manager.timeout_check_interval must be greater than 0");
        }

        Ok(())
    }

    fn validate_socket_config(&self) -> Result<()> {
        if self.socket.idle_timeout.subsec_nanos() != 0 {
            bail!("socket.idle_timeout must be a whole number of seconds");
        }

        if self.socket.idle_timeout.as_secs() > u32::MAX as u64 {
            bail!("socket.idle_timeout is too large");
        }

        Ok(())
    }

    fn validate_rate_config(&self) -> Result<()> {
        if self.rate.max_bytes > 0 && self.rate.window.is_zero() {
            bail!("rate.window must be greater than 0 when rate.max_bytes is set");
        }

        Ok(())
    }

    fn validate_tls_config(&self) -> Result<()> {
        if self.tls.enabled && self.tls.pem_file.is_none() {
            bail!("tls.pem_file is required when TLS is enabled");
        }

        if self.tls.cipher.trim().is_empty() {
            bail!("tls.cipher cannot be empty");
        }

        Ok(())
    }

    fn validate_listener_config(&self) -> Result<()> {
        if self.listener.name.is_empty() {
            bail!("listener.name cannot be empty");
        }

        if self.listener.backlog == 0 {
            bail!("listener.backlog must be greater than 0");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        port: Option<u16>,
        bind_host: Option<&str>,
        enable_tls: bool,
        pem_file: Option<&Path>,
        require_client_cert: bool,
        idle_timeout: Option<u64>,
    ) {
        if let Some(port) = port {
            self.listener.port = port;
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(bind_host) = bind_host {
            self.listener.bind_host = Some(bind_host.to_string());
            tracing::info!("CLI override: bind host set to {}", bind_host);
        }

        if enable_tls {
            self.tls.enabled = true;
            tracing::info!("CLI override: TLS enabled");
        }

        if let Some(pem_file) = pem_file {
            self.tls.pem_file = Some(pem_file.to_path_buf());
            tracing::info!("CLI override: pem file set to {}", pem_file.display());
        }

        if require_client_cert {
            self.tls.require_client_cert = true;
            tracing::info!("CLI override: client certificates required");
        }

        if let Some(timeout_secs) = idle_timeout {
            self.socket.idle_timeout = std::time::Duration::from_secs(timeout_secs);
            tracing::info!("CLI override: idle timeout set to {}s", timeout_secs);
        }
    }
}
