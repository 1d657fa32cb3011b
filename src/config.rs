use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use claimr::coordinator::{CoordinatorConfig, RetryPolicy};
use claimr::daemon::TickConfig;
use claimr::ipc::IpcServerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub max_clients: usize,
    pub stale_timeout_secs: Option<u64>,
    pub sweep_interval_secs: u64,
    pub state_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "tcp://127.0.0.1:5555".to_string(),
            max_clients: 64,
            stale_timeout_secs: None,
            sweep_interval_secs: 5,
            state_file: None,
        }
    }
}

impl ServerConfig {
    pub fn ipc(&self) -> IpcServerConfig {
        IpcServerConfig::default()
            .with_endpoint(&self.bind)
            .with_max_clients(self.max_clients)
    }

    pub fn tick(&self) -> TickConfig {
        TickConfig::new(
            Duration::from_secs(self.sweep_interval_secs),
            self.stale_timeout_secs.map(Duration::from_secs),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub timeout_ms: u64,
    pub retries: u32,
    pub backoff_ms: u64,
    pub telemetry_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "tcp://127.0.0.1:5555".to_string(),
            timeout_ms: 10000,
            retries: 3,
            backoff_ms: 500,
            telemetry_interval_secs: 60,
        }
    }
}

impl ClientConfig {
    /// Coordinator settings, with `server` overriding `server_url` when given.
    pub fn coordinator(&self, server: Option<&str>) -> CoordinatorConfig {
        CoordinatorConfig::with_endpoint(server.unwrap_or(&self.server_url))
            .timeout(Duration::from_millis(self.timeout_ms))
            .retry(RetryPolicy::new(self.retries, Duration::from_millis(self.backoff_ms)))
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::debug!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind, "tcp://127.0.0.1:5555");
        assert_eq!(config.server.max_clients, 64);
        assert!(config.server.stale_timeout_secs.is_none());
        assert_eq!(config.client.timeout_ms, 10000);
        assert_eq!(config.client.retries, 3);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  stale_timeout_secs: 3600\nclient:\n  server_url: tcp://head:7000").unwrap();

        let config = Config::load(Some(&file.path().to_path_buf())).unwrap();
        assert_eq!(config.server.stale_timeout_secs, Some(3600));
        assert_eq!(config.server.sweep_interval_secs, 5);
        assert_eq!(config.client.server_url, "tcp://head:7000");
        assert_eq!(config.client.backoff_ms, 500);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let path = PathBuf::from("/nonexistent/claimr.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_server_conversions() {
        let server = ServerConfig {
            stale_timeout_secs: Some(60),
            max_clients: 8,
            ..Default::default()
        };
        let tick = server.tick();
        assert_eq!(tick.stale_timeout, Some(Duration::from_secs(60)));
        assert!(tick.sweeps_enabled());
        assert_eq!(server.ipc().max_clients, 8);
    }

    #[test]
    fn test_client_override() {
        let client = ClientConfig::default();
        let coordinator = client.coordinator(Some("tcp://other:1"));
        assert_eq!(coordinator.endpoint, "tcp://other:1");
        assert_eq!(coordinator.timeout, Duration::from_secs(10));
        assert_eq!(client.coordinator(None).endpoint, "tcp://127.0.0.1:5555");
    }
}
