//! Configuration module for the telemetry components.
//!
//! The log store is configured from a JSON document loaded once at startup.
//! The delivery client and the collector server read their network settings
//! from environment variables, falling back to defaults.

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use serde_json::{Map, Value};

/// Default collector host for the delivery client
const DEFAULT_HOST: &str = "127.0.0.1";

/// Default collector port
const DEFAULT_PORT: u16 = 5000;

/// Default per-attempt timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Default number of delivery attempts per reading
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default pause between delivery attempts in milliseconds
const DEFAULT_BACKOFF_MS: u64 = 1_000;

/// Upper bound on delivery attempts to keep a single send bounded
const MAX_ATTEMPTS_LIMIT: u32 = 100;

/// Default time the server waits for a complete message
const DEFAULT_READ_TIMEOUT_SECS: u64 = 10;

/// Largest message the server accepts, delimiter included
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Name of the archive directory created below the log directory
const ARCHIVE_SUBDIR: &str = "archive";

/// Variable naming the store configuration file
const STORE_CONFIG_ENV: &str = "SENSOR_TELEMETRY_STORE_CONFIG";

/// Store configuration file used when the variable is unset
const DEFAULT_STORE_CONFIG: &str = "config.json";

/// Log directory used when no configuration file exists
const DEFAULT_LOG_DIR: &str = "logs";

/// Error type for configuration loading failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub message: String,
    pub field: Option<String>,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    fn field(field: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(f, "Configuration error for {}: {}", field, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for the rotating log store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Directory holding the active and not yet archived log files
    pub log_dir: PathBuf,

    /// Directory holding compressed archives
    pub archive_dir: PathBuf,

    /// strftime pattern formatted against local time to name the active file
    pub filename_pattern: String,

    /// Number of readings buffered in memory before a flush
    pub buffer_size: usize,

    /// Rotate once the active file has been open this many hours
    pub rotate_every_hours: u64,

    /// Rotate once the active file reaches this size in MiB
    pub max_size_mb: f64,

    /// Rotate once this many readings were appended since the file was opened
    pub rotate_after_lines: Option<u64>,

    /// Archives older than this many days are deleted at rotation
    pub retention_days: u64,
}

impl StoreConfig {
    /// Create a configuration with defaults for everything but the log directory.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let log_dir = log_dir.into();
        Self {
            archive_dir: log_dir.join(ARCHIVE_SUBDIR),
            log_dir,
            filename_pattern: "readings_%Y-%m-%d_%H.csv".to_string(),
            buffer_size: 10,
            rotate_every_hours: 24,
            max_size_mb: 10.0,
            rotate_after_lines: None,
            retention_days: 30,
        }
    }

    /// Load the configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, is not valid JSON,
    /// or any field is missing, mistyped or out of range.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::new(format!("cannot read {}: {}", path.display(), e))
        })?;
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            ConfigError::new(format!("{} is not valid JSON: {}", path.display(), e))
        })?;
        Self::from_json(&value)
    }

    /// Build the configuration from an already parsed JSON document.
    pub fn from_json(value: &Value) -> Result<Self, ConfigError> {
        let object = value
            .as_object()
            .ok_or_else(|| ConfigError::new("configuration must be a JSON object"))?;

        let log_dir = PathBuf::from(require_str(object, "log_dir")?);
        let archive_dir = match object.get("archive_dir") {
            None | Some(Value::Null) => log_dir.join(ARCHIVE_SUBDIR),
            Some(_) => PathBuf::from(require_str(object, "archive_dir")?),
        };

        let buffer_size = require_u64(object, "buffer_size")?;
        if buffer_size == 0 {
            return Err(ConfigError::field(
                "buffer_size",
                "buffer size must be greater than 0",
            ));
        }
        let buffer_size = usize::try_from(buffer_size)
            .map_err(|_| ConfigError::field("buffer_size", "buffer size is too large"))?;

        let max_size_mb = require_number(object, "max_size_mb")?;
        if !max_size_mb.is_finite() || max_size_mb < 0.0 {
            return Err(ConfigError::field(
                "max_size_mb",
                format!("{} is not a valid size", max_size_mb),
            ));
        }

        let rotate_after_lines = match object.get("rotate_after_lines") {
            None | Some(Value::Null) => None,
            Some(_) => {
                let lines = require_u64(object, "rotate_after_lines")?;
                if lines == 0 {
                    return Err(ConfigError::field(
                        "rotate_after_lines",
                        "line threshold must be greater than 0",
                    ));
                }
                Some(lines)
            }
        };

        let config = Self {
            log_dir,
            archive_dir,
            filename_pattern: require_str(object, "filename_pattern")?.to_string(),
            buffer_size,
            rotate_every_hours: require_u64(object, "rotate_every_hours")?,
            max_size_mb,
            rotate_after_lines,
            retention_days: require_u64(object, "retention_days")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the log store relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_dir.as_os_str().is_empty() {
            return Err(ConfigError::field("log_dir", "log directory must not be empty"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::field(
                "buffer_size",
                "buffer size must be greater than 0",
            ));
        }
        if self.rotate_after_lines == Some(0) {
            return Err(ConfigError::field(
                "rotate_after_lines",
                "line threshold must be greater than 0",
            ));
        }
        if !self.max_size_mb.is_finite() || self.max_size_mb < 0.0 {
            return Err(ConfigError::field(
                "max_size_mb",
                format!("{} is not a valid size", self.max_size_mb),
            ));
        }
        validate_pattern(&self.filename_pattern)
    }

    /// Rotation interval as a duration.
    pub fn rotate_every(&self) -> Duration {
        Duration::from_secs(self.rotate_every_hours.saturating_mul(3600))
    }

    /// Size threshold in bytes.
    pub fn max_size_bytes(&self) -> u64 {
        (self.max_size_mb * 1_048_576.0) as u64
    }

    /// Archive retention horizon as a duration.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(86_400))
    }

    /// Load the configuration file named by `SENSOR_TELEMETRY_STORE_CONFIG`.
    ///
    /// Without the variable, `config.json` in the working directory is used
    /// when present, and defaults with `log_dir = "logs"` otherwise. A file
    /// named explicitly must exist.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var(STORE_CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim()),
            _ if Path::new(DEFAULT_STORE_CONFIG).is_file() => Self::from_file(DEFAULT_STORE_CONFIG),
            _ => Ok(Self::new(DEFAULT_LOG_DIR)),
        }
    }
}

fn require<'a>(object: &'a Map<String, Value>, key: &str) -> Result<&'a Value, ConfigError> {
    object
        .get(key)
        .ok_or_else(|| ConfigError::field(key, "missing required field"))
}

fn require_str<'a>(object: &'a Map<String, Value>, key: &str) -> Result<&'a str, ConfigError> {
    require(object, key)?
        .as_str()
        .ok_or_else(|| ConfigError::field(key, "expected a string"))
}

fn require_u64(object: &Map<String, Value>, key: &str) -> Result<u64, ConfigError> {
    require(object, key)?
        .as_u64()
        .ok_or_else(|| ConfigError::field(key, "expected a non-negative integer"))
}

fn require_number(object: &Map<String, Value>, key: &str) -> Result<f64, ConfigError> {
    require(object, key)?
        .as_f64()
        .ok_or_else(|| ConfigError::field(key, "expected a number"))
}

/// Reject patterns chrono cannot format or that would escape the log directory.
fn validate_pattern(pattern: &str) -> Result<(), ConfigError> {
    const FIELD: &str = "filename_pattern";

    if pattern.trim().is_empty() {
        return Err(ConfigError::field(FIELD, "pattern must not be empty"));
    }
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return Err(ConfigError::field(
            FIELD,
            format!("'{}' is not a valid time format", pattern),
        ));
    }

    let sample = chrono::Local::now().format(pattern).to_string();
    if sample.contains('/') || sample.contains('\\') || sample == "." || sample == ".." {
        return Err(ConfigError::field(
            FIELD,
            format!("'{}' must produce a bare file name", pattern),
        ));
    }
    Ok(())
}

/// Configuration for the delivery client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Collector host name or address
    pub host: String,

    /// Collector port
    pub port: u16,

    /// Bound on connecting and on waiting for the acknowledgment, per attempt
    pub timeout: Duration,

    /// Number of attempts per reading before giving up
    pub max_attempts: u32,

    /// Pause between attempts
    pub backoff: Duration,
}

impl ClientConfig {
    /// Load configuration from environment variables.
    ///
    /// - `SENSOR_TELEMETRY_HOST` (default: 127.0.0.1)
    /// - `SENSOR_TELEMETRY_PORT` (default: 5000)
    /// - `SENSOR_TELEMETRY_TIMEOUT_SECS` (default: 5)
    /// - `SENSOR_TELEMETRY_MAX_ATTEMPTS` (default: 3)
    /// - `SENSOR_TELEMETRY_BACKOFF_MS` (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("SENSOR_TELEMETRY_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        if host.trim().is_empty() {
            return Err(ConfigError::field(
                "SENSOR_TELEMETRY_HOST",
                "host must not be empty",
            ));
        }

        let port = parse_env("SENSOR_TELEMETRY_PORT", DEFAULT_PORT)?;

        let timeout_secs: u64 = parse_env("SENSOR_TELEMETRY_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            return Err(ConfigError::field(
                "SENSOR_TELEMETRY_TIMEOUT_SECS",
                "timeout must be greater than 0",
            ));
        }

        let max_attempts: u32 = parse_env("SENSOR_TELEMETRY_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        if max_attempts == 0 || max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(ConfigError::field(
                "SENSOR_TELEMETRY_MAX_ATTEMPTS",
                format!("attempts must be between 1 and {}", MAX_ATTEMPTS_LIMIT),
            ));
        }

        let backoff_ms: u64 = parse_env("SENSOR_TELEMETRY_BACKOFF_MS", DEFAULT_BACKOFF_MS)?;

        Ok(Self {
            host,
            port,
            timeout: Duration::from_secs(timeout_secs),
            max_attempts,
            backoff: Duration::from_millis(backoff_ms),
        })
    }

    /// The `host:port` string the client connects to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
        }
    }
}

/// Configuration for the collector server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub bind_addr: SocketAddr,

    /// Time allowed for a client to deliver a complete message
    pub read_timeout: Duration,

    /// Largest accepted message, delimiter included
    pub max_message_size: usize,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// - `SENSOR_TELEMETRY_BIND` (default: 0.0.0.0)
    /// - `SENSOR_TELEMETRY_PORT` (default: 5000)
    /// - `SENSOR_TELEMETRY_READ_TIMEOUT_SECS` (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let ip: IpAddr = parse_env("SENSOR_TELEMETRY_BIND", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?;
        let port = parse_env("SENSOR_TELEMETRY_PORT", DEFAULT_PORT)?;

        let read_timeout_secs: u64 =
            parse_env("SENSOR_TELEMETRY_READ_TIMEOUT_SECS", DEFAULT_READ_TIMEOUT_SECS)?;
        if read_timeout_secs == 0 {
            return Err(ConfigError::field(
                "SENSOR_TELEMETRY_READ_TIMEOUT_SECS",
                "read timeout must be greater than 0",
            ));
        }

        Ok(Self {
            bind_addr: SocketAddr::new(ip, port),
            read_timeout: Duration::from_secs(read_timeout_secs),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        })
    }

    /// Configuration bound to the given address with default limits.
    pub fn with_addr(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Parse an optional environment variable, falling back to a default when unset.
fn parse_env<T: std::str::FromStr>(env_var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(env_var) {
        Ok(value) => value.trim().parse().map_err(|_| {
            ConfigError::field(env_var, format!("'{}' is not a valid value", value))
        }),
        Err(_) => Ok(default),
    }
}
