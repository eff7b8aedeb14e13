use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the classification server
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Camera configuration
    #[serde(default)]
    pub camera: CameraConfig,
    /// Classifier configuration
    pub classifier: ClassifierConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Captured frame archive configuration
    #[serde(default)]
    pub archive: ArchiveConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Metrics port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Camera configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// V4L2 device path
    #[serde(default = "default_camera_device")]
    pub device: String,
    /// Requested frame width
    #[serde(default = "default_camera_width")]
    pub width: u32,
    /// Requested frame height
    #[serde(default = "default_camera_height")]
    pub height: u32,
    /// Warm-up wait after opening the camera, in milliseconds
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
    /// Frame grab attempts per request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between grab attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// How long a request waits for the camera before it is rejected as busy
    #[serde(default = "default_lease_wait_ms")]
    pub lease_wait_ms: u64,
    /// Timeout for a single grab in milliseconds
    #[serde(default = "default_grab_timeout_ms")]
    pub grab_timeout_ms: u64,
}

/// Classifier configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Inference endpoint URL
    pub endpoint: String,
    /// Square input edge length expected by the model
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    /// Inference request timeout in seconds
    #[serde(default = "default_classifier_timeout_secs")]
    pub timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL (empty = in-memory store)
    #[serde(default)]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
    /// How long a request waits for its event write before responding anyway
    #[serde(default = "default_write_wait_ms")]
    pub write_wait_ms: u64,
}

/// Captured frame archive configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveConfig {
    /// Directory for captured frames (None = frames are not kept)
    #[serde(default)]
    pub dir: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "halo-server".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_camera_device() -> String {
    "/dev/video0".to_string()
}

fn default_camera_width() -> u32 {
    640
}

fn default_camera_height() -> u32 {
    480
}

fn default_warmup_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_lease_wait_ms() -> u64 {
    30_000
}

fn default_grab_timeout_ms() -> u64 {
    2000
}

fn default_input_size() -> u32 {
    224
}

fn default_classifier_timeout_secs() -> u64 {
    10
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_write_wait_ms() -> u64 {
    2000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: default_camera_device(),
            width: default_camera_width(),
            height: default_camera_height(),
            warmup_ms: default_warmup_ms(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            lease_wait_ms: default_lease_wait_ms(),
            grab_timeout_ms: default_grab_timeout_ms(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
            write_wait_ms: default_write_wait_ms(),
        }
    }
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/server").required(false))
            .add_source(config::File::with_name("/etc/halo/server").required(false))
            // Override with environment variables
            // SERVER__CAMERA__WARMUP_MS -> camera.warmup_ms
            .add_source(
                config::Environment::with_prefix("SERVER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.classifier.endpoint.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "classifier.endpoint".to_string(),
            ));
        }
        if !self.classifier.endpoint.starts_with("http://")
            && !self.classifier.endpoint.starts_with("https://")
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "classifier.endpoint".to_string(),
                message: "must start with http:// or https://".to_string(),
            });
        }
        if self.classifier.input_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "classifier.input_size".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.camera.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera.max_attempts".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.camera.device.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "camera.device".to_string(),
            ));
        }
        if !self.database.url.is_empty()
            && self.database.min_connections > self.database.max_connections
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "database.min_connections".to_string(),
                message: "must not exceed database.max_connections".to_string(),
            });
        }
        Ok(())
    }

    /// Get event write wait as Duration
    pub fn db_write_wait(&self) -> Duration {
        Duration::from_millis(self.database.write_wait_ms)
    }

    /// Get inference request timeout as Duration
    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_secs(self.classifier.timeout_secs)
    }
}

impl DatabaseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl CameraConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn lease_wait(&self) -> Duration {
        Duration::from_millis(self.lease_wait_ms)
    }

    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
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
