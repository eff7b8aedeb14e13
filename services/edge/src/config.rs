//! Configuration management for the edge controller.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use halo_protocol::Label;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the edge controller.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeConfig {
    /// Classification server configuration
    pub server: ServerConfig,

    /// Network attachment configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Presence sensor configuration
    #[serde(default)]
    pub sensor: SensorConfig,

    /// Sorting servo configuration
    #[serde(default)]
    pub actuator: ActuatorConfig,

    /// Reply handling configuration
    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Classification server endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server base URL (e.g., "http://172.20.10.3:5000")
    pub base_url: String,

    /// Path of the trigger endpoint
    #[serde(default = "default_trigger_path")]
    pub trigger_path: String,

    /// Trigger request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Reachability probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

/// Network attachment configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Network interface carrying the link to the server
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Wi-Fi SSID to join (None = link managed outside this process)
    #[serde(default)]
    pub ssid: Option<String>,

    /// Wi-Fi passphrase
    #[serde(default)]
    pub password: Option<String>,

    /// Link checks before giving up on a connection attempt
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between link checks in milliseconds
    #[serde(default = "default_attempt_interval_ms")]
    pub attempt_interval_ms: u64,
}

/// Presence sensor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    /// GPIO line of the PIR sensor
    #[serde(default = "default_gpio_pin")]
    pub gpio_pin: u32,

    /// Root of the sysfs GPIO tree
    #[serde(default = "default_gpio_root")]
    pub gpio_root: String,

    /// Delay between sensor polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Sorting servo configuration.
///
/// Duty cycles use a 16-bit scale (0-65535 of the PWM period), so at 50 Hz
/// 1638 is a ~0.5 ms pulse (rest) and 8192 a ~2.5 ms pulse.
#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorConfig {
    /// sysfs PWM chip directory
    #[serde(default = "default_pwm_chip")]
    pub pwm_chip: String,

    /// PWM channel per bin, in bin order
    #[serde(default = "default_channels")]
    pub channels: Vec<u32>,

    /// PWM period in nanoseconds
    #[serde(default = "default_period_ns")]
    pub period_ns: u64,

    /// Rest duty cycle
    #[serde(default = "default_duty_low")]
    pub duty_low: u16,

    /// Upper duty cycle bound
    #[serde(default = "default_duty_high")]
    pub duty_high: u16,

    /// Duty increment per sweep step
    #[serde(default = "default_step")]
    pub step: u16,

    /// Delay between sweep steps in milliseconds
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,

    /// Hold time at the midpoint in milliseconds
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,

    /// Settle time after returning to rest in milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

/// Reply handling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    /// Labels whose reply tokens are wired to an actuation
    #[serde(default = "default_recognized_labels")]
    pub recognized_labels: Vec<Label>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_trigger_path() -> String {
    "/run".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_probe_timeout() -> u64 {
    5
}
fn default_interface() -> String {
    "wlan0".to_string()
}
fn default_max_attempts() -> u32 {
    20
}
fn default_attempt_interval_ms() -> u64 {
    1000
}
fn default_gpio_pin() -> u32 {
    25
}
fn default_gpio_root() -> String {
    "/sys/class/gpio".to_string()
}
fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_pwm_chip() -> String {
    "/sys/class/pwm/pwmchip0".to_string()
}
fn default_channels() -> Vec<u32> {
    vec![0, 1, 2]
}
fn default_period_ns() -> u64 {
    20_000_000 // 50 Hz
}
fn default_duty_low() -> u16 {
    1638
}
fn default_duty_high() -> u16 {
    8192
}
fn default_step() -> u16 {
    100
}
fn default_step_delay_ms() -> u64 {
    20
}
fn default_hold_ms() -> u64 {
    2000
}
fn default_settle_ms() -> u64 {
    2000
}
fn default_recognized_labels() -> Vec<Label> {
    // Metal has a bin but no wired actuation branch yet.
    vec![Label::Paper, Label::Plastic]
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            ssid: None,
            password: None,
            max_attempts: default_max_attempts(),
            attempt_interval_ms: default_attempt_interval_ms(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            gpio_pin: default_gpio_pin(),
            gpio_root: default_gpio_root(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            pwm_chip: default_pwm_chip(),
            channels: default_channels(),
            period_ns: default_period_ns(),
            duty_low: default_duty_low(),
            duty_high: default_duty_high(),
            step: default_step(),
            step_delay_ms: default_step_delay_ms(),
            hold_ms: default_hold_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            recognized_labels: default_recognized_labels(),
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

impl EdgeConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. `config/edge.toml`
    /// 2. `/etc/halo/edge.toml`
    /// 3. Environment variables (prefixed with EDGE__)
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/edge").required(false))
            .add_source(File::with_name("/etc/halo/edge").required(false))
            // Override with environment variables (e.g., EDGE__SERVER__BASE_URL)
            .add_source(
                Environment::with_prefix("EDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.server.base_url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "server.base_url".to_string(),
            ));
        }
        if !self.server.base_url.starts_with("http://")
            && !self.server.base_url.starts_with("https://")
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.base_url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }

        if self.server.request_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.request_timeout_secs".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }

        if self.sensor.poll_interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "sensor.poll_interval_ms".to_string(),
                message: "Poll interval must be greater than 0".to_string(),
            });
        }

        if self.network.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "network.max_attempts".to_string(),
                message: "At least one attempt is required".to_string(),
            });
        }

        let actuator = &self.actuator;
        if actuator.channels.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "actuator.channels".to_string(),
            ));
        }
        if actuator.duty_low >= actuator.duty_high {
            return Err(ConfigValidationError::InvalidValue {
                field: "actuator.duty_low/duty_high".to_string(),
                message: "duty_low must be below duty_high".to_string(),
            });
        }
        if actuator.step == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "actuator.step".to_string(),
                message: "Step must be greater than 0".to_string(),
            });
        }

        for label in &self.trigger.recognized_labels {
            if label.bin_index() >= actuator.channels.len() {
                return Err(ConfigValidationError::InvalidValue {
                    field: "trigger.recognized_labels".to_string(),
                    message: format!(
                        "{} routes to bin {} but only {} channels are configured",
                        label,
                        label.bin_index(),
                        actuator.channels.len()
                    ),
                });
            }
        }

        Ok(())
    }
}

impl ServerConfig {
    /// Get trigger request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get probe timeout as Duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl NetworkConfig {
    /// Get delay between link checks as Duration.
    pub fn attempt_interval(&self) -> Duration {
        Duration::from_millis(self.attempt_interval_ms)
    }
}

impl SensorConfig {
    /// Get sensor poll cadence as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
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

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> EdgeConfig {
        EdgeConfig {
            server: ServerConfig {
                base_url: "http://172.20.10.3:5000".to_string(),
                trigger_path: default_trigger_path(),
                request_timeout_secs: 30,
                probe_timeout_secs: 5,
            },
            network: NetworkConfig::default(),
            sensor: SensorConfig::default(),
            actuator: ActuatorConfig::default(),
            trigger: TriggerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_base_url() {
        let mut config = create_test_config();
        config.server.base_url = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_base_url() {
        let mut config = create_test_config();
        config.server.base_url = "ftp://172.20.10.3:5000".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_timing_rejected() {
        let mut config = create_test_config();
        config.server.request_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { field, .. }) if field == "server.request_timeout_secs"
        ));

        let mut config = create_test_config();
        config.sensor.poll_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { field, .. }) if field == "sensor.poll_interval_ms"
        ));
    }

    #[test]
    fn test_inverted_duty_bounds() {
        let mut config = create_test_config();
        config.actuator.duty_low = 9000;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_recognized_label_needs_a_channel() {
        let mut config = create_test_config();
        config.actuator.channels = vec![0, 1];
        assert!(config.validate().is_ok());

        config.trigger.recognized_labels.push(Label::Metal);
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_defaults_follow_hardware() {
        let actuator = ActuatorConfig::default();
        assert_eq!(actuator.duty_low, 1638);
        assert_eq!(actuator.duty_high, 8192);
        assert_eq!(actuator.channels.len(), 3);
        assert_eq!(NetworkConfig::default().max_attempts, 20);
        assert_eq!(
            TriggerConfig::default().recognized_labels,
            vec![Label::Paper, Label::Plastic]
        );
    }
}
