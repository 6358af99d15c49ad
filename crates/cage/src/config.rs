//! Client configuration.
//!
//! Read from `~/.config/cage/config.toml` when present; every field has a
//! default so a missing file just means defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::engine::EngineTransport;

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Dataset location holding container roots.
    #[serde(default = "default_containers_location")]
    pub containers_location: String,

    /// Dataset location holding named volumes.
    #[serde(default = "default_volumes_location")]
    pub volumes_location: String,

    /// Unix socket of the engine daemon.
    #[serde(default = "default_engine_socket")]
    pub engine_socket: String,

    /// HTTP endpoint for the engine; overrides the socket transport when set.
    #[serde(default)]
    pub engine_url: Option<String>,
}

fn default_containers_location() -> String {
    "zroot/cage/containers".to_string()
}

fn default_volumes_location() -> String {
    "zroot/cage/volumes".to_string()
}

fn default_engine_socket() -> String {
    "/var/run/cage.sock".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            containers_location: default_containers_location(),
            volumes_location: default_volumes_location(),
            engine_socket: default_engine_socket(),
            engine_url: None,
        }
    }
}

impl Config {
    /// Load configuration. An explicit path must exist; the default location
    /// is optional.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let (file, required) = match path {
            Some(p) => (
                Some(PathBuf::from(shellexpand::tilde(p).into_owned())),
                true,
            ),
            None => (
                dirs::config_dir().map(|dir| dir.join("cage/config.toml")),
                false,
            ),
        };

        match file {
            Some(file) if file.exists() => {
                debug!("loading config from {}", file.display());
                let text = std::fs::read_to_string(&file)
                    .with_context(|| format!("reading config {}", file.display()))?;
                toml::from_str(&text)
                    .with_context(|| format!("parsing config {}", file.display()))
            }
            Some(file) if required => {
                anyhow::bail!("config file not found: {}", file.display())
            }
            _ => Ok(Self::default()),
        }
    }

    /// The transport the engine client should use.
    pub fn engine_transport(&self) -> EngineTransport {
        match &self.engine_url {
            Some(url) => EngineTransport::Http(url.clone()),
            None => EngineTransport::Unix(PathBuf::from(
                shellexpand::tilde(&self.engine_socket).into_owned(),
            )),
        }
    }
}
