// Service Configuration
//
// Loaded from a JSON file. The built-in defaults are used when no file is
// given, and the worker count can be overridden from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidemark_kernel::retry::RetryPolicy;

/// Environment variable overriding `server.num_threads`.
pub const NUM_THREADS_ENV: &str = "TIDEMARK_NUM_THREADS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value `{value}` for {name}")]
    InvalidEnv { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TidemarkConfig {
    /// Directory holding `<namespace>/<table>` table roots.
    pub warehouse: PathBuf,
    pub log_format: LogFormat,
    pub retry: RetryPolicy,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,

    /// Requested number of request workers.
    pub num_threads: usize,

    /// Floor applied to `num_threads`.
    pub min_threads: usize,

    /// Largest request accepted in a single read.
    pub max_message_bytes: usize,

    /// How long shutdown waits for in-flight requests.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1234".into(),
            num_threads: 10,
            min_threads: 10,
            max_message_bytes: 16_384,
            shutdown_timeout_secs: 120,
        }
    }
}

impl ServerConfig {
    /// Worker count after the floor is applied.
    pub fn worker_threads(&self) -> usize {
        self.num_threads.max(self.min_threads).max(1)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for TidemarkConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl TidemarkConfig {
    /// Built-in configuration, used when no config file is given.
    pub fn default_config() -> Self {
        Self {
            warehouse: PathBuf::from("warehouse"),
            log_format: LogFormat::default(),
            retry: RetryPolicy::default(),
            server: ServerConfig::default(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read `path` if given, else the defaults, then apply the
    /// environment override.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default_config(),
        };
        config.override_num_threads(std::env::var(NUM_THREADS_ENV).ok().as_deref())?;
        Ok(config)
    }

    pub fn override_num_threads(&mut self, value: Option<&str>) -> Result<(), ConfigError> {
        if let Some(value) = value {
            self.server.num_threads =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    name: NUM_THREADS_ENV,
                    value: value.into(),
                })?;
        }
        Ok(())
    }
}
