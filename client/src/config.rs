use std::{env, path::PathBuf, time::Duration};
use thiserror::Error;
use url::Url;

use crate::orchestrator::DEFAULT_RESUBSCRIBE_DELAY;

/// Device-side configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Root URL of the sync server
    pub server_url: Url,
    /// Directory for local snapshots and the device id
    pub data_dir: PathBuf,
    /// Owner of the remote documents
    pub owner_id: String,
    /// Bearer token; defaults to the owner id (development servers)
    pub auth_token: Option<String>,
    pub request_timeout: Duration,
    pub resubscribe_delay: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {message}")]
    Invalid { name: &'static str, message: String },
}

pub const DEFAULT_DATA_DIR: &str = ".ensemble";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

impl ClientConfig {
    pub fn new(server_url: Url, owner_id: impl Into<String>) -> Self {
        Self {
            server_url,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            owner_id: owner_id.into(),
            auth_token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
        }
    }

    /// Read `ENSEMBLE_SERVER_URL`, `ENSEMBLE_OWNER_ID`, `ENSEMBLE_DATA_DIR`,
    /// `ENSEMBLE_AUTH_TOKEN` and `ENSEMBLE_REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let server_url = lookup("ENSEMBLE_SERVER_URL")
            .ok_or(ConfigError::Missing("ENSEMBLE_SERVER_URL"))?;
        let server_url = Url::parse(&server_url).map_err(|e| ConfigError::Invalid {
            name: "ENSEMBLE_SERVER_URL",
            message: e.to_string(),
        })?;

        let owner_id = lookup("ENSEMBLE_OWNER_ID")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("ENSEMBLE_OWNER_ID"))?;

        let mut config = Self::new(server_url, owner_id);

        if let Some(dir) = lookup("ENSEMBLE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.auth_token = lookup("ENSEMBLE_AUTH_TOKEN").filter(|t| !t.is_empty());

        if let Some(ms) = lookup("ENSEMBLE_REQUEST_TIMEOUT_MS") {
            let ms: u64 = ms.parse().map_err(|_| ConfigError::Invalid {
                name: "ENSEMBLE_REQUEST_TIMEOUT_MS",
                message: format!("not a number: {ms}"),
            })?;
            config.request_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Token sent to the server.
    pub fn bearer_token(&self) -> &str {
        self.auth_token.as_deref().unwrap_or(&self.owner_id)
    }
}
