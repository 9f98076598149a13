//! Server configuration.
//!
//! Read from the process environment (after loading an optional `.env`):
//!
//! | Variable                  | Default   | Meaning                                  |
//! |---------------------------|-----------|------------------------------------------|
//! | `HOST`                    | `0.0.0.0` | Listen address                           |
//! | `PORT`                    | `8080`    | Listen port                              |
//! | `STORAGE_BACKEND`         | `fs`      | `fs`, `rocks` or `memory`                |
//! | `STORAGE_PATH`            | `./data`  | Directory for `fs` / `rocks`             |
//! | `OUTBOUND_QUEUE_CAPACITY` | `256`     | Per-connection queue before backpressure |
//! | `HUB_IDLE_EVICTION_SECS`  | `30`      | Idle hub lifetime, `0` = never evict     |

use std::path::PathBuf;
use std::time::Duration;

use crate::hub::HubConfig;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_STORAGE_PATH: &str = "./data";

/// Which document store backs the server.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageBackend {
    /// Nothing survives a restart
    Memory,
    /// One JSON file per project
    FileSystem(PathBuf),
    /// RocksDB database directory
    Rocks(PathBuf),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Document store
    pub storage: StorageBackend,
    /// Per-hub tuning
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("{DEFAULT_HOST}:{DEFAULT_PORT}"),
            storage: StorageBackend::FileSystem(PathBuf::from(DEFAULT_STORAGE_PATH)),
            hub: HubConfig::default(),
        }
    }
}

impl ServerConfig {
    /// In-memory config bound to `bind_addr`. Handy for tests and embedding.
    pub fn in_memory(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            storage: StorageBackend::Memory,
            ..Self::default()
        }
    }

    /// Build from the environment, loading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset and empty values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host = get("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match get("PORT") {
            Some(raw) => parse::<u16>("PORT", &raw)?,
            None => DEFAULT_PORT,
        };

        let path = PathBuf::from(get("STORAGE_PATH").unwrap_or_else(|| DEFAULT_STORAGE_PATH.into()));
        let storage = match get("STORAGE_BACKEND").as_deref().map(str::to_ascii_lowercase) {
            None => StorageBackend::FileSystem(path),
            Some(kind) => match kind.as_str() {
                "fs" | "file" | "filesystem" => StorageBackend::FileSystem(path),
                "rocks" | "rocksdb" => StorageBackend::Rocks(path),
                "memory" | "mem" => StorageBackend::Memory,
                _ => return Err(ConfigError::invalid("STORAGE_BACKEND", &kind)),
            },
        };

        let mut hub = HubConfig::default();
        if let Some(raw) = get("OUTBOUND_QUEUE_CAPACITY") {
            let capacity = parse::<usize>("OUTBOUND_QUEUE_CAPACITY", &raw)?;
            if capacity == 0 {
                return Err(ConfigError::invalid("OUTBOUND_QUEUE_CAPACITY", &raw));
            }
            hub.outbound_capacity = capacity;
        }
        if let Some(raw) = get("HUB_IDLE_EVICTION_SECS") {
            hub.idle_eviction = match parse::<u64>("HUB_IDLE_EVICTION_SECS", &raw)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            };
        }

        Ok(Self {
            bind_addr: format!("{host}:{port}"),
            storage,
            hub,
        })
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::invalid(key, raw))
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    InvalidValue { key: &'static str, value: String },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str) -> Self {
        ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { key, value } => {
                write!(f, "Invalid value for {key}: {value:?}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.storage, StorageBackend::FileSystem(PathBuf::from("./data")));
        assert_eq!(config.hub.outbound_capacity, 256);
        assert_eq!(config.hub.idle_eviction, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.storage, StorageBackend::FileSystem(PathBuf::from("./data")));

        let config = config_from(&[("PORT", ""), ("STORAGE_PATH", " ")]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_environment_overrides() {
        let config = config_from(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "9001"),
            ("STORAGE_BACKEND", "RocksDB"),
            ("STORAGE_PATH", "/var/lib/patchhub"),
            ("OUTBOUND_QUEUE_CAPACITY", "16"),
            ("HUB_IDLE_EVICTION_SECS", "0"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9001");
        assert_eq!(config.storage, StorageBackend::Rocks(PathBuf::from("/var/lib/patchhub")));
        assert_eq!(config.hub.outbound_capacity, 16);
        assert_eq!(config.hub.idle_eviction, None);
    }

    #[test]
    fn test_memory_backend() {
        let config = config_from(&[("STORAGE_BACKEND", "memory")]).unwrap();
        assert_eq!(config.storage, StorageBackend::Memory);
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(
            config_from(&[("PORT", "eighty")]).unwrap_err(),
            ConfigError::InvalidValue { key: "PORT", value: "eighty".into() }
        );
        assert!(config_from(&[("PORT", "70000")]).is_err());
        assert!(config_from(&[("STORAGE_BACKEND", "s3")]).is_err());
        assert!(config_from(&[("OUTBOUND_QUEUE_CAPACITY", "0")]).is_err());
        assert!(config_from(&[("HUB_IDLE_EVICTION_SECS", "-1")]).is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("PORT", "x");
        assert_eq!(err.to_string(), "Invalid value for PORT: \"x\"");
    }
}
