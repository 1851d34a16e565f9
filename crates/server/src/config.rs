//! Configuration persistence for the VAR server.
//!
//! Configuration is loaded with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/var-server/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hub repository with the VAR and VQVAE checkpoints.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_repo: Option<String>,

    /// Hub repository with the CLIP text tower and tokenizer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_repo: Option<String>,

    /// Port to listen on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Host to bind to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Maximum prompts per batch request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<usize>,

    /// Generations running at once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_workers: Option<usize>,

    /// Maximum pending requests in queue before rejecting with 503.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queue_depth: Option<usize>,

    /// Seconds to wait for in-flight generations on shutdown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_timeout: Option<u64>,

    /// Comma-separated list of allowed CORS origins. "*" allows all origins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origins: Option<String>,

    /// Comma-separated list of allowed CORS HTTP methods.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_methods: Option<String>,

    /// Comma-separated list of allowed CORS headers. "*" allows all headers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_headers: Option<String>,

    /// Data type for model weights (f32, f16, bf16).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Run on CPU even when an accelerator is compiled in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<bool>,
}

impl ServerConfig {
    /// Keys accepted by [`ServerConfig::set`].
    pub const KEYS: &'static [&'static str] = &[
        "model_repo",
        "clip_repo",
        "port",
        "host",
        "max_batch_size",
        "num_workers",
        "max_queue_depth",
        "shutdown_timeout",
        "allowed_origins",
        "allowed_methods",
        "allowed_headers",
        "dtype",
        "log_level",
        "cpu",
    ];

    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("var-server").join("config.toml"))
    }

    /// Load configuration from the default path.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }

        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Render as TOML for `config show`.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Set one field from its string form, as given to `config set`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "model_repo" => self.model_repo = Some(value.to_string()),
            "clip_repo" => self.clip_repo = Some(value.to_string()),
            "port" => self.port = Some(parse_value(key, value)?),
            "host" => self.host = Some(value.to_string()),
            "max_batch_size" => self.max_batch_size = Some(parse_value(key, value)?),
            "num_workers" => self.num_workers = Some(parse_value(key, value)?),
            "max_queue_depth" => self.max_queue_depth = Some(parse_value(key, value)?),
            "shutdown_timeout" => self.shutdown_timeout = Some(parse_value(key, value)?),
            "allowed_origins" => self.allowed_origins = Some(value.to_string()),
            "allowed_methods" => self.allowed_methods = Some(value.to_string()),
            "allowed_headers" => self.allowed_headers = Some(value.to_string()),
            "dtype" => self.dtype = Some(value.to_string()),
            "log_level" => self.log_level = Some(value.to_string()),
            "cpu" => self.cpu = Some(parse_value(key, value)?),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &ServerConfig) {
        if other.model_repo.is_some() {
            self.model_repo = other.model_repo.clone();
        }
        if other.clip_repo.is_some() {
            self.clip_repo = other.clip_repo.clone();
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.host.is_some() {
            self.host = other.host.clone();
        }
        if other.max_batch_size.is_some() {
            self.max_batch_size = other.max_batch_size;
        }
        if other.num_workers.is_some() {
            self.num_workers = other.num_workers;
        }
        if other.max_queue_depth.is_some() {
            self.max_queue_depth = other.max_queue_depth;
        }
        if other.shutdown_timeout.is_some() {
            self.shutdown_timeout = other.shutdown_timeout;
        }
        if other.allowed_origins.is_some() {
            self.allowed_origins = other.allowed_origins.clone();
        }
        if other.allowed_methods.is_some() {
            self.allowed_methods = other.allowed_methods.clone();
        }
        if other.allowed_headers.is_some() {
            self.allowed_headers = other.allowed_headers.clone();
        }
        if other.dtype.is_some() {
            self.dtype = other.dtype.clone();
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level.clone();
        }
        if other.cpu.is_some() {
            self.cpu = other.cpu;
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
    /// No config directory available.
    NoConfigDir,
    UnknownKey(String),
    InvalidValue { key: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No config directory available"),
            ConfigError::UnknownKey(key) => write!(
                f,
                "Unknown config key '{}' (expected one of: {})",
                key,
                ServerConfig::KEYS.join(", ")
            ),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "Invalid value '{}' for '{}'", value, key)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
