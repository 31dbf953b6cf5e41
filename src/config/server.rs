use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// How often the maintenance pass runs.
    pub maintenance_interval: Duration,
    /// Upper bound on rows touched by a single maintenance step.
    pub batch_size: usize,
}

/// On-disk form of [`ServerConfig`]; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    host: Option<String>,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
    maintenance_interval_secs: Option<u64>,
    batch_size: Option<usize>,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("zoekt-coordinator.db")
    }

    #[must_use]
    pub fn admin_token_path(&self) -> PathBuf {
        self.data_dir.join(".admin_token")
    }

    /// Loads a TOML config file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        let defaults = Self::default();

        let config = Self {
            host: file.host.unwrap_or(defaults.host),
            port: file.port.unwrap_or(defaults.port),
            data_dir: file.data_dir.unwrap_or(defaults.data_dir),
            maintenance_interval: file
                .maintenance_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.maintenance_interval),
            batch_size: file.batch_size.unwrap_or(defaults.batch_size),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.maintenance_interval.is_zero() {
            return Err(Error::Config(
                "maintenance_interval_secs must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            maintenance_interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = ServerConfig::from_toml("port = 9090\nbatch_size = 10\n").unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.maintenance_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let result = ServerConfig::from_toml("prot = 9090\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let result = ServerConfig::from_toml("maintenance_interval_secs = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_db_path_lives_in_data_dir() {
        let config = ServerConfig {
            data_dir: PathBuf::from("/var/lib/zoekt"),
            ..ServerConfig::default()
        };
        assert_eq!(
            config.db_path(),
            PathBuf::from("/var/lib/zoekt/zoekt-coordinator.db")
        );
    }
}
