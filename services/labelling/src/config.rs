use serde::Deserialize;
use std::path::PathBuf;

/// Main configuration for the labelling service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    /// Selection store connection
    pub database: DatabaseConfig,
    /// Media tree configuration
    pub media: MediaConfig,
    /// Rank assignment configuration
    #[serde(default)]
    pub selection: SelectionConfig,
    /// HTTP surface
    #[serde(default)]
    pub api: ApiConfig,
}

/// Process identity, logging and metrics exporter
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Reported in the startup log line
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json or pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Expose Prometheus metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Port of the Prometheus scrape endpoint
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// PostgreSQL pool settings
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL, or `memory://` for a process-local store
    pub url: String,
    /// Pool size ceiling
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connections kept open while idle
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Seconds to wait for a pooled connection
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Seconds before an idle connection is closed
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Apply `migrations/` before serving
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

impl DatabaseConfig {
    /// Whether the configured URL selects the in-memory store
    pub fn is_memory(&self) -> bool {
        self.url.starts_with(MEMORY_DATABASE_SCHEME)
    }
}

/// URL scheme selecting the in-memory selection store
pub const MEMORY_DATABASE_SCHEME: &str = "memory://";

/// Media tree configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Base directory laid out as `<category>/<video>/<frame>`
    pub root: PathBuf,
    /// Frame file extensions, matched case-insensitively
    #[serde(default = "default_frame_extensions")]
    pub frame_extensions: Vec<String>,
}

/// Rank assignment configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SelectionConfig {
    /// How many times a conflicting read-modify-write is retried before
    /// the conflict is surfaced to the caller
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Bind address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// Bind port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Attach a CORS layer to the router
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed origins; empty allows any
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Header carrying the authenticated labeller name, set by the
    /// upstream identity proxy
    #[serde(default = "default_actor_header")]
    pub actor_header: String,
}

fn default_service_name() -> String {
    "labelling-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_frame_extensions() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
}

fn default_max_conflict_retries() -> u32 {
    1
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_actor_header() -> String {
    "x-labeller".to_string()
}

impl Config {
    /// Merge `config/labelling.*`, `/etc/labelling/labelling.*` and
    /// `LABELLING__*` environment variables, later sources winning.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/labelling").required(false))
            .add_source(config::File::with_name("/etc/labelling/labelling").required(false))
            // LABELLING__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("LABELLING")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("media.frame_extensions")
                    .with_list_parse_key("api.cors_origins")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Validate the loaded configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("database.url".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.max_connections".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.min_connections".to_string(),
                message: "must not exceed max_connections".to_string(),
            });
        }

        if self.media.root.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField("media.root".to_string()));
        }

        if self.media.frame_extensions.is_empty() {
            return Err(ConfigValidationError::InvalidValue {
                field: "media.frame_extensions".to_string(),
                message: "at least one extension is required".to_string(),
            });
        }

        if self.api.actor_header.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("api.actor_header".to_string()));
        }

        if !matches!(self.service.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigValidationError::InvalidValue {
                field: "service.log_format".to_string(),
                message: format!("expected json or pretty, got {}", self.service.log_format),
            });
        }

        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_enabled: default_true(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            actor_header: default_actor_header(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
