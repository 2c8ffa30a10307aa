//! Configuration files and the queue owner's settings.

use err_derive::Error;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

#[derive(Debug, Error)]
pub enum ConfigErr {
    #[error(display = "Cannot read config file {}: {}", _0, _1)]
    Io(String, #[error(source, no_from)] std::io::Error),

    #[error(display = "TOML deserialization error: {}", _0)]
    TomlDes(#[error(source)] toml::de::Error),

    #[error(display = "Invalid configuration: {}", _0)]
    Invalid(String),
}

/// Read a TOML config file. A missing `path` yields the type's defaults.
pub async fn load_toml<T>(path: Option<&Path>) -> Result<T, ConfigErr>
where
    T: DeserializeOwned + Default,
{
    let path = match path {
        Some(p) => p,
        None => return Ok(T::default()),
    };
    tracing::debug!("Reading config file {}", path.display());
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigErr::Io(path.display().to_string(), e))?;
    Ok(toml::from_str::<T>(&data)?)
}

/// `~/.codejudge`, or `./.codejudge` when no home directory is known.
pub fn default_cache_folder() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".codejudge")
}

/// Settings for the queue-owning HTTP service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Shared credential workers must present.
    pub api_token: Option<String>,
    /// Skip the trusted-network check. Only meant for tests and demos.
    pub allow_any_network: bool,
    /// JSON file with initial problems and submissions.
    pub seed: Option<PathBuf>,
    /// Number of co-located worker cycles to run in the same process.
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: ([127, 0, 0, 1], 8080).into(),
            api_token: None,
            allow_any_network: false,
            seed: None,
            workers: 0,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigErr> {
        match self.api_token.as_deref() {
            None | Some("") => Err(ConfigErr::Invalid("an API token is required".into())),
            Some(_) => Ok(()),
        }
    }
}
