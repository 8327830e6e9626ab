use std::{env, fmt::Display, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use log::{info, warn};
use thiserror::Error;

pub const DEFAULT_PORT: &str = "8000";
pub const DEFAULT_IDLE_TIMEOUT_SECS: &str = "60";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {key} value: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub access_token_secret: String,
    pub cors_origin: String,
    /// Connections with no inbound frame for this long are closed.
    pub idle_timeout: Duration,
    pub directory_seed: Option<PathBuf>,
    pub database_url: Option<String>,
    pub inactivity_enabled: bool,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let port: u16 = try_load("PORT", DEFAULT_PORT)?;
        let idle_secs: u64 = try_load("IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT_SECS)?;

        Ok(Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            access_token_secret: var("ACCESS_TOKEN_SECRET").ok_or(ConfigError::Missing("ACCESS_TOKEN_SECRET"))?,
            cors_origin: try_load("CORS_ORIGIN", "*")?,
            idle_timeout: Duration::from_secs(idle_secs),
            directory_seed: var("DIRECTORY_SEED").map(PathBuf::from),
            database_url: var("DATABASE_URL"),
            inactivity_enabled: try_load("INACTIVITY_ENABLED", "true")?,
        })
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn try_load<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e: T::Err| {
            warn!("Invalid {key} value: {e}");
            ConfigError::Invalid {
                key,
                reason: e.to_string(),
            }
        })
}
