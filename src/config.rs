use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use crate::db::client::PoolSettings;
use crate::error::WardenError;

/// Environment variables consulted by [`Config::from_env`].
const ENV_KEYS: &[&str] = &[
    "DIRECT_URL",
    "MAX_CONNECTIONS",
    "MIN_CONNECTIONS",
    "ACQUIRE_TIMEOUT_SECS",
    "POLICY_PATH",
    "LOGLEVEL",
];

/// Process configuration. Only `direct_url` is required.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub direct_url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default)]
    pub min_connections: u32,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// TOML policy consumed by the enhanced client. Unset means deny-all.
    #[serde(default)]
    pub policy_path: Option<PathBuf>,

    #[serde(default = "default_loglevel")]
    pub loglevel: String,
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_loglevel() -> String {
    "info".to_string()
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, WardenError> {
        Self::from_figment(Figment::new().merge(Env::raw().only(ENV_KEYS)))
    }

    /// Read configuration from a TOML file, with the environment taking precedence.
    pub fn from_toml_and_env(path: impl Into<PathBuf>) -> Result<Self, WardenError> {
        let figment = Figment::new()
            .merge(Toml::file(path.into()))
            .merge(Env::raw().only(ENV_KEYS));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> Result<Self, WardenError> {
        let cfg: Config = figment.extract()?;
        if cfg.direct_url.trim().is_empty() {
            return Err(figment::Error::from("DIRECT_URL must not be empty".to_string()).into());
        }
        Ok(cfg)
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.max_connections.max(1),
            min_connections: self.min_connections,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
        }
    }
}

pub static CONFIG: LazyLock<Config> = LazyLock::new(|| {
    dotenvy::dotenv().ok();
    match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => panic!("FATAL: invalid configuration: {e}"),
    }
});
