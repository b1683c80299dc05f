use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration for the backend service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// MQTT feed configuration
    #[serde(default)]
    pub mqtt: MqttConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// MQTT feed connection
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker host name
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Client ID, must be unique per broker for QoS 1/2 sessions
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Discard the broker session on connect
    #[serde(default)]
    pub clean_session: bool,
    /// Quality of service for subscriptions and publishes (0, 1 or 2)
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Capacity of the client request channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Capacity of the ingest queue between event loop and worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Pause before polling again after a connection error
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// How long a statement waits on a locked database, in seconds
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Query/command API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Reflect the request origin in CORS headers
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
}

// Default value functions
fn default_service_name() -> String {
    "iot-backend".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "iot-backend".to_string()
}

fn default_keep_alive_secs() -> u64 {
    20
}

fn default_qos() -> u8 {
    1
}

fn default_channel_capacity() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    256
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_database_url() -> String {
    "sqlite://values.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_busy_timeout_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from `.env`, config files and environment
    pub fn load() -> Result<Self, ConfigError> {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/backend").required(false))
            .add_source(config::File::with_name("/etc/iot-backend/backend").required(false))
            // BACKEND__MQTT__HOST -> mqtt.host
            .add_source(
                config::Environment::with_prefix("BACKEND")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the feed or store cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("mqtt.client_id must not be empty".into()));
        }
        if self.mqtt.qos > 2 {
            return Err(ConfigError::Invalid(format!(
                "mqtt.qos must be 0, 1 or 2, got {}",
                self.mqtt.qos
            )));
        }
        if self.mqtt.channel_capacity == 0 || self.mqtt.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "mqtt channel and queue capacities must be positive".into(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "database.max_connections must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive_secs(),
            clean_session: false,
            qos: default_qos(),
            channel_capacity: default_channel_capacity(),
            queue_capacity: default_queue_capacity(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            busy_timeout_secs: default_busy_timeout_secs(),
            run_migrations: default_true(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
        }
    }
}
