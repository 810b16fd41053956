//! Configuration loading
//!
//! Loads the YAML configuration file and applies environment overrides.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a YAML file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&contents)
        .map_err(|e| ConfigError::Parse(format!("{e} in {path:?}")))?;

    config.validate()?;

    info!(
        tunnel = %config.tunnel.name,
        socks5 = %format!("{}:{}", config.socks5.address, config.socks5.port),
        mapdns = config.mapdns.is_some(),
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a YAML string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(yaml: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `TUNSOCKS_SOCKS5_ADDRESS`: Override the SOCKS5 server host
/// - `TUNSOCKS_SOCKS5_PORT`: Override the SOCKS5 server port
///
/// # Errors
///
/// Returns `ConfigError` if loading fails or an override is malformed.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(addr) = std::env::var("TUNSOCKS_SOCKS5_ADDRESS") {
        debug!("SOCKS5 address overridden to {}", addr);
        config.socks5.address = addr;
    }

    if let Ok(port) = std::env::var("TUNSOCKS_SOCKS5_PORT") {
        config.socks5.port = port.parse().map_err(|_| ConfigError::Env {
            name: "TUNSOCKS_SOCKS5_PORT".into(),
            reason: format!("Invalid port: {port}"),
        })?;
        debug!("SOCKS5 port overridden to {}", config.socks5.port);
    }

    config.validate()?;

    Ok(config)
}
