use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;

/// Name of the SQLite database file inside `state_dir`.
pub const DATABASE_FILE: &str = "plotshare-state.db";

/// Where requests and chat messages are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Sqlite,
    /// Lost on restart. Useful for local trials.
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown storage backend '{}', expected sqlite or memory", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    pub storage_backend: StorageBackend,
    /// Per-request live buffer. A subscriber that falls further behind is
    /// dropped and has to re-open the channel.
    pub channel_capacity: usize,
    /// Optional shared secret the fronting gateway presents as
    /// `Authorization: Bearer <token>`. If not set, API calls are not checked.
    pub api_auth_token: Option<String>,
    pub log_level: Level,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let storage_backend = env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "sqlite".to_string())
            .parse::<StorageBackend>()
            .context("STORAGE_BACKEND must be sqlite or memory")?;

        let channel_capacity = env::var("CHANNEL_CAPACITY")
            .unwrap_or_else(|_| "256".to_string())
            .parse::<usize>()
            .context("CHANNEL_CAPACITY must be a valid number")?;
        if channel_capacity == 0 {
            bail!("CHANNEL_CAPACITY must be at least 1");
        }

        let api_auth_token = parse_api_auth_token(env::var("API_AUTH_TOKEN").ok());

        let log_level = parse_log_level(env::var("LOG_LEVEL").ok())
            .context("LOG_LEVEL must be one of trace, debug, info, warn, error")?;

        Ok(Config {
            port,
            state_dir,
            storage_backend,
            channel_capacity,
            api_auth_token,
            log_level,
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join(DATABASE_FILE)
    }
}

/// Parse API_AUTH_TOKEN from an optional string value.
///
/// Returns None if the value is missing, empty, or contains only whitespace,
/// so an empty token never matches an empty header.
pub fn parse_api_auth_token(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Parse LOG_LEVEL, defaulting to `info` when unset or blank.
pub fn parse_log_level(value: Option<String>) -> Result<Level> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(Level::INFO),
        Some(level) => level
            .parse::<Level>()
            .with_context(|| format!("invalid log level '{}'", level)),
    }
}
