use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use ruma::OwnedServerName;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_TXN_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_TXN_RETRY_LIMIT: u32 = 5;
pub const DEFAULT_FEDERATION_SYNC_LIMIT: usize = 50;

const CONFIG_DIR: &str = ".roomserv";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub transaction_timeout_ms: u64,
    pub transaction_retry_limit: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: DEFAULT_TXN_TIMEOUT_MS,
            transaction_retry_limit: DEFAULT_TXN_RETRY_LIMIT,
        }
    }
}

impl DatabaseConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Max super-stream items folded into one outgoing transaction.
    pub sync_limit: usize,
    pub lock_retry_secs: u64,
    pub lock_timeout_secs: u64,
    /// Consecutive empty polls before a server sender exits its lease.
    pub idle_polls_before_exit: u32,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            sync_limit: DEFAULT_FEDERATION_SYNC_LIMIT,
            lock_retry_secs: 30,
            lock_timeout_secs: 60,
            idle_polls_before_exit: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// External pub/sub target for cross-process change hints. Empty means
    /// single-process deployment.
    #[serde(default)]
    pub bus_target: Option<String>,
    #[serde(default)]
    pub bus_channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_name: OwnedServerName,
    pub data_dir: PathBuf,

    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Config {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            server_name: OwnedServerName::try_from("localhost").expect("static server name"),
            data_dir: base_dir().join("data"),
            database: DatabaseConfig::default(),
            federation: FederationConfig::default(),
            notifier: NotifierConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

fn base_dir() -> PathBuf {
    // Relative fallback keeps the binary usable when the working directory
    // cannot be resolved.
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(CONFIG_DIR)
}

fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| base_dir().join(CONFIG_FILE))
}

/// Load the config file, seeding it with defaults on first run. Returns the
/// effective config together with the path it lives at, with the data
/// directory guaranteed to exist.
pub fn load_or_default(explicit: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = resolve_config_path(explicit);
    let config = match Config::load(&path)? {
        Some(config) => config,
        None => {
            let config = Config::default();
            config.persist(&path)?;
            config
        }
    };
    fs::create_dir_all(&config.data_dir)?;
    Ok((config, path))
}

impl Config {
    /// Read and parse the file at `path`; `None` when it does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(toml::from_str(&contents)?))
    }

    /// Write the config to `path`, creating missing parent directories.
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn rooms_db_path(&self) -> PathBuf {
        self.data_dir.join("rooms")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_load_seeds_and_reload_agrees() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("conf").join("config.toml");

        assert!(Config::load(&path).unwrap().is_none());

        let (seeded, seeded_path) = load_or_default(Some(path.clone())).unwrap();
        assert_eq!(seeded_path, path);
        assert_eq!(seeded.database.transaction_retry_limit, DEFAULT_TXN_RETRY_LIMIT);
        assert!(seeded.data_dir.is_dir());

        let (reloaded, _) = load_or_default(Some(path)).unwrap();
        assert_eq!(reloaded.server_name, seeded.server_name);
        assert_eq!(reloaded.created_at, seeded.created_at);
    }

    #[test]
    fn persist_roundtrips_through_toml() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");

        let mut config = Config::default();
        config.server_name = OwnedServerName::try_from("hs1").unwrap();
        config.federation.sync_limit = 25;
        config.persist(&path).unwrap();

        let loaded = Config::load(&path).unwrap().unwrap();
        assert_eq!(loaded.server_name.as_str(), "hs1");
        assert_eq!(loaded.federation.sync_limit, 25);
    }
}
