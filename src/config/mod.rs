//! TOML configuration: the model host, the retry budget, and the tool
//! servers to connect. A missing config file is not an error; the defaults
//! target a local Ollama-style host with no servers.

use crate::application::connection::ToolServerConnection;
use crate::application::service::ToolsService;
use crate::infrastructure::model::HostConnection;
use crate::infrastructure::transport::Transport;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "config/client.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("server entry '{name}' must set exactly one of 'path' or 'url'")]
    Endpoint { name: String },
}

/// The model host the client talks to.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelHostConfig {
    pub host: String,
    pub credential: String,
    pub model: String,
}

impl Default for ModelHostConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434/v1".to_string(),
            credential: "ollama".to_string(),
            model: "llama3.2".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub iteration_ceiling: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            iteration_ceiling: 24,
        }
    }
}

/// One tool server: a stdio server program (`path`) or an event-stream
/// endpoint (`url`). Exactly one of the two must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl ServerEntry {
    pub fn transport(&self) -> Result<Transport, ConfigError> {
        match (&self.path, &self.url) {
            (Some(path), None) => Ok(Transport::stdio(path)),
            (None, Some(url)) => Ok(Transport::sse(url.clone())),
            _ => Err(ConfigError::Endpoint {
                name: self.name.clone(),
            }),
        }
    }

    /// A ready-to-connect connection carrying this entry's identity.
    pub fn connection(&self) -> Result<ToolServerConnection, ConfigError> {
        Ok(ToolServerConnection::with_identity(
            self.transport()?,
            self.name.clone(),
            self.version.clone(),
        ))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    model: ModelHostConfig,
    #[serde(default)]
    retry: RetryConfig,
    #[serde(default)]
    servers: Vec<ServerEntry>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: ModelHostConfig,
    pub retry: RetryConfig,
    pub servers: Vec<ServerEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_raw(RawConfig::default())
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_raw(raw);
        for entry in &config.servers {
            entry.transport()?;
        }
        Ok(config)
    }

    fn from_raw(raw: RawConfig) -> Self {
        Self {
            model: raw.model,
            retry: raw.retry,
            servers: raw.servers,
        }
    }

    pub fn host_connection(&self) -> HostConnection {
        HostConnection::new(
            self.model.credential.clone(),
            self.model.host.clone(),
            self.model.model.clone(),
        )
    }

    /// A tools service talking to the configured model host with the
    /// configured retry budget. Server connections are registered by the
    /// caller once connected.
    pub fn tools_service(&self) -> ToolsService {
        ToolsService::with_limits(
            Arc::new(self.host_connection()),
            self.retry.max_attempts,
            self.retry.iteration_ceiling,
        )
    }
}
