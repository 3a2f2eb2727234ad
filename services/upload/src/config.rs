use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised when a loaded configuration is not usable
#[derive(Debug, Error)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingField(String),

    #[error("Invalid configuration value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Main configuration for the upload service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// On-disk storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Per-client admission limits
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Image re-encoding configuration
    #[serde(default)]
    pub image: ImageConfig,
    /// Expiry of stored objects
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Audit trail configuration
    #[serde(default)]
    pub audit: AuditConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
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
    /// Log output format ("json" or "pretty")
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Install the Prometheus exporter
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Where and how uploads are persisted
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the sharded upload tree
    #[serde(default = "default_upload_root")]
    pub upload_root: PathBuf,
    /// Largest accepted upload, measured on the received bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
    /// Media types accepted after content sniffing
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
    /// Reject uploads whose sniffed type is not in `allowed_mime_types`
    #[serde(default = "default_true")]
    pub enforce_content_type: bool,
}

/// Sliding-window admission settings
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Admissions allowed per client within one window
    #[serde(default = "default_upload_limit")]
    pub upload_limit: usize,
    /// Window length in seconds
    #[serde(default = "default_time_window_secs")]
    pub time_window_secs: u64,
    /// How often idle client entries are dropped
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

/// Raster image bounding settings
#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    /// Run the transform at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Images wider than this are scaled down proportionally
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    /// Lossy encoder quality (1-100)
    #[serde(default = "default_quality")]
    pub quality: u8,
    /// Lower-cased extensions that trigger the transform
    #[serde(default = "default_image_extensions")]
    pub extensions: Vec<String>,
}

/// Expiry sweep settings
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Files older than this are deleted
    #[serde(default = "default_expiration_secs")]
    pub expiration_secs: u64,
    /// Delay between sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Audit trail settings
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Append-only audit file; `None` keeps the records in the tracing output only
    #[serde(default = "default_audit_path")]
    pub path: Option<PathBuf>,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Base used for returned file URLs (derived from the Host header when unset)
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Content-Security-Policy attached to every response
    #[serde(default = "default_content_security_policy")]
    pub content_security_policy: String,
    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "upload-service".to_string()
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

fn default_true() -> bool {
    true
}

fn default_upload_root() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_max_file_size() -> u64 {
    200 * 1024 * 1024 // 200 MiB
}

fn default_allowed_mime_types() -> Vec<String> {
    [
        "image/png",
        "image/jpeg",
        "image/gif",
        "video/mp4",
        "video/webm",
        "video/quicktime",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_upload_limit() -> usize {
    1
}

fn default_time_window_secs() -> u64 {
    10
}

fn default_purge_interval_secs() -> u64 {
    60
}

fn default_max_width() -> u32 {
    800
}

fn default_quality() -> u8 {
    70
}

fn default_image_extensions() -> Vec<String> {
    ["png", "jpg", "jpeg", "gif"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_expiration_secs() -> u64 {
    24 * 3600
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_audit_path() -> Option<PathBuf> {
    Some(PathBuf::from("uploads.log"))
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    5000
}

fn default_content_security_policy() -> String {
    "default-src 'self'; img-src 'self' data: https:; script-src 'self'".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/upload").required(false))
            .add_source(config::File::with_name("/etc/mediadrop/upload").required(false))
            // Override with environment variables
            // UPLOAD__RATE_LIMIT__TIME_WINDOW_SECS -> rate_limit.time_window_secs
            .add_source(
                config::Environment::with_prefix("UPLOAD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Check that limits and intervals are usable.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.storage.upload_root.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.upload_root".to_string(),
            ));
        }

        if self.storage.max_file_size_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.max_file_size_bytes".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.rate_limit.upload_limit == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "rate_limit.upload_limit".to_string(),
                message: "must allow at least one upload per window".to_string(),
            });
        }

        if self.rate_limit.time_window_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "rate_limit.time_window_secs".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if self.image.max_width == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "image.max_width".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }

        if !(1..=100).contains(&self.image.quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "image.quality".to_string(),
                message: format!("{} is outside 1..=100", self.image.quality),
            });
        }

        if self.retention.expiration_secs == 0 || self.retention.sweep_interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "retention".to_string(),
                message: "expiration and sweep interval must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Get the rate-limit window as Duration
    pub fn time_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.time_window_secs)
    }

    /// Get the rate-limiter purge interval as Duration
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limit.purge_interval_secs.max(1))
    }

    /// Get the object expiration age as Duration
    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.retention.expiration_secs)
    }

    /// Get the sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention.sweep_interval_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_enabled: true,
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_root: default_upload_root(),
            max_file_size_bytes: default_max_file_size(),
            allowed_mime_types: default_allowed_mime_types(),
            enforce_content_type: true,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            upload_limit: default_upload_limit(),
            time_window_secs: default_time_window_secs(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_width: default_max_width(),
            quality: default_quality(),
            extensions: default_image_extensions(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            expiration_secs: default_expiration_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            public_base_url: None,
            content_security_policy: default_content_security_policy(),
            cors_enabled: false,
            cors_origins: Vec::new(),
        }
    }
}
