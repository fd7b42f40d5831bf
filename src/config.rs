use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Forwarder configuration, usually read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Samples per second; also sizes batches and timestamp precision.
    pub poll_rate: f64,
    /// Address the HTTP control API listens on.
    pub listen_address: String,
    /// `InfluxDB` endpoint (e.g., `http://localhost:8086`).
    pub influx_endpoint: String,
    /// `InfluxDB` v1 database name.
    pub database: String,
    pub retention_policy: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// When non-empty, batches are published to these NATS servers instead of
    /// being written to `InfluxDB`.
    pub nats_servers: Vec<String>,
    /// Subject prefix used when publishing to NATS.
    pub nats_subject: String,
    /// Measurement name stamped on every sample.
    pub metric_name: String,
    /// Tags stamped on every sample.
    pub tags: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poll_rate: 1.0,
            listen_address: "localhost:8080".to_string(),
            influx_endpoint: "http://localhost:8086".to_string(),
            database: "docbrown".to_string(),
            retention_policy: None,
            username: None,
            password: None,
            nats_servers: Vec::new(),
            nats_subject: "metrics".to_string(),
            metric_name: "fluxCapacitor".to_string(),
            tags: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Reads `path`, falling back to defaults if the file does not exist.
    ///
    /// # Errors
    ///
    /// Errors if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "Configuration file not found, using defaults");

                return Ok(Config::default());
            }
            Err(source) => return Err(ConfigError::Read { path: path.to_path_buf(), source }),
        };

        serde_json::from_str(&data)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Read config; path={path:?}; err={source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("Parse config; path={path:?}; err={source}")]
    Parse { path: PathBuf, source: serde_json::Error },
}
