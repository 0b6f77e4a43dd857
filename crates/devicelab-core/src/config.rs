//! Runtime configuration
//!
//! Loaded once at startup. Unknown driver identifiers fail fast with
//! `DriverInvalid` when the registry builds its driver set.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::driver::KNOWN_DRIVERS;
use crate::error::{Error, Result};

fn default_drivers() -> Vec<String> {
    KNOWN_DRIVERS.iter().map(|s| s.to_string()).collect()
}

fn default_session_timeout() -> u64 {
    300_000
}

/// Control-plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Driver identifiers to load at startup
    #[serde(default = "default_drivers")]
    pub drivers: Vec<String>,

    /// Session TTL in milliseconds
    #[serde(default = "default_session_timeout")]
    pub device_session_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            drivers: default_drivers(),
            device_session_timeout: default_session_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.device_session_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.drivers.len(), 4);
        assert_eq!(config.device_session_timeout, 300_000);
        assert_eq!(config.session_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devicelab.json");
        std::fs::write(&path, r#"{ "drivers": ["ios-simulator"] }"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.drivers, vec!["ios-simulator"]);
        assert_eq!(config.device_session_timeout, 300_000);
    }

    #[test]
    fn test_load_session_timeout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devicelab.json");
        std::fs::write(&path, r#"{ "deviceSessionTimeout": 60000 }"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.session_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let err = Config::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_load_malformed_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devicelab.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::load(&path).unwrap_err(), Error::Json(_)));
    }
}
