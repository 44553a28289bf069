use chrono::Offset;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised when a loaded configuration is inconsistent
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Main configuration for the inspection service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Cycle processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Photo staging configuration
    #[serde(default)]
    pub photos: PhotoConfig,
    /// Machine statistics configuration
    #[serde(default)]
    pub machine: MachineConfig,
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
    /// Log output format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port (0 disables the exporter)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Claim owner name for this process
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
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
}

/// Cycle detection, settlement and driver cadence
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Quiescence window after a cycle's end event
    #[serde(default = "default_wait_time_seconds")]
    pub wait_time_seconds: u64,
    /// Events fetched per page of the backlog
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pages scanned per pass; a pass reads at most
    /// `batch_size * max_pages_per_pass` events
    #[serde(default = "default_max_pages_per_pass")]
    pub max_pages_per_pass: usize,
    /// An open cycle with no tick for this long is abandoned (0 = never)
    #[serde(default = "default_open_cycle_timeout_secs")]
    pub open_cycle_timeout_secs: u64,
    /// Fail an inspection when any of its PLC ticks raised `Falla`
    #[serde(default)]
    pub fail_on_plc_flag: bool,
    /// Driver cadence
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// How long a claim on a cycle's events stays exclusive
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
    /// Run orphan photo recovery every N passes (0 = never)
    #[serde(default = "default_recovery_every_passes")]
    pub recovery_every_passes: u64,
    /// Offset applied to timestamps that carry no UTC offset
    #[serde(default)]
    pub plant_utc_offset_minutes: i32,
}

/// Photo staging and processed directories
#[derive(Debug, Clone, Deserialize)]
pub struct PhotoConfig {
    /// Directory cameras drop photographs into
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Root of the per-cycle processed directories
    #[serde(default = "default_processed_dir")]
    pub processed_dir: PathBuf,
    /// Accepted photo extensions, lowercase, without the dot
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Substring marking test/calibration shots in the control point or
    /// result tag
    #[serde(default = "default_exclusion_marker")]
    pub exclusion_marker: String,
    /// Result tag of a passing photo
    #[serde(default = "default_pass_marker")]
    pub pass_marker: String,
    /// Move `.svg` overlays together with their photo
    #[serde(default = "default_true")]
    pub move_sidecars: bool,
}

/// Machine whose aggregate counters are maintained
#[derive(Debug, Clone, Deserialize)]
pub struct MachineConfig {
    #[serde(default = "default_machine_id")]
    pub machine_id: String,
}

// Default value functions
fn default_service_name() -> String {
    "inspection-service".to_string()
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

fn default_worker_id() -> String {
    format!("{}-{}", default_service_name(), uuid::Uuid::new_v4())
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

fn default_wait_time_seconds() -> u64 {
    300 // 5 minutes
}

fn default_batch_size() -> usize {
    500
}

fn default_max_pages_per_pass() -> usize {
    10
}

fn default_open_cycle_timeout_secs() -> u64 {
    3600
}

fn default_poll_interval_seconds() -> u64 {
    30
}

fn default_claim_lease_secs() -> u64 {
    120
}

fn default_recovery_every_passes() -> u64 {
    10
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("media/inspection_photos/STAGING")
}

fn default_processed_dir() -> PathBuf {
    PathBuf::from("media/inspection_photos/PROCESSED")
}

fn default_extensions() -> Vec<String> {
    ["bmp", "jpg", "jpeg", "png"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_exclusion_marker() -> String {
    "tes".to_string()
}

fn default_pass_marker() -> String {
    "OK".to_string()
}

fn default_machine_id() -> String {
    "MAQ-001".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "inspection-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(
                config::File::with_name("config/inspection")
                    .required(false)
            )
            .add_source(
                config::File::with_name("/etc/fuel-inspection/inspection")
                    .required(false)
            )
            // Override with environment variables
            // INSPECTION__PROCESSING__WAIT_TIME_SECONDS -> processing.wait_time_seconds
            .add_source(
                config::Environment::with_prefix("INSPECTION")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("photos.extensions")
                    .try_parsing(true)
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::MissingRequired("database.url".to_string()));
        }
        self.processing.validate()?;
        self.photos.validate()
    }
}

impl ProcessingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "processing.batch_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.max_pages_per_pass == 0 {
            return Err(ConfigError::InvalidValue {
                key: "processing.max_pages_per_pass".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.poll_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                key: "processing.poll_interval_seconds".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Settlement window as a chrono duration
    pub fn wait_time(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.wait_time_seconds as i64)
    }

    /// Get the driver cadence as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    /// Silence after which an open cycle is abandoned
    pub fn open_cycle_timeout(&self) -> Option<chrono::Duration> {
        (self.open_cycle_timeout_secs > 0)
            .then(|| chrono::Duration::seconds(self.open_cycle_timeout_secs as i64))
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_lease_secs as i64)
    }

    /// Offset used for naive PLC and filename timestamps
    pub fn plant_offset(&self) -> chrono::FixedOffset {
        chrono::FixedOffset::east_opt(self.plant_utc_offset_minutes * 60)
            .unwrap_or_else(|| chrono::Utc.fix())
    }
}

impl PhotoConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.staging_dir == self.processed_dir {
            return Err(ConfigError::InvalidValue {
                key: "photos.processed_dir".to_string(),
                message: "must differ from photos.staging_dir".to_string(),
            });
        }
        if self.extensions.is_empty() {
            return Err(ConfigError::MissingRequired("photos.extensions".to_string()));
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
            metrics_port: default_metrics_port(),
            worker_id: default_worker_id(),
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            wait_time_seconds: default_wait_time_seconds(),
            batch_size: default_batch_size(),
            max_pages_per_pass: default_max_pages_per_pass(),
            open_cycle_timeout_secs: default_open_cycle_timeout_secs(),
            fail_on_plc_flag: false,
            poll_interval_seconds: default_poll_interval_seconds(),
            claim_lease_secs: default_claim_lease_secs(),
            recovery_every_passes: default_recovery_every_passes(),
            plant_utc_offset_minutes: 0,
        }
    }
}

impl Default for PhotoConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            processed_dir: default_processed_dir(),
            extensions: default_extensions(),
            exclusion_marker: default_exclusion_marker(),
            pass_marker: default_pass_marker(),
            move_sidecars: true,
        }
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            machine_id: default_machine_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let processing = ProcessingConfig::default();
        assert_eq!(processing.wait_time_seconds, 300);
        assert_eq!(processing.batch_size, 500);
        assert_eq!(processing.poll_interval_seconds, 30);
        assert_eq!(processing.wait_time(), chrono::Duration::seconds(300));
        assert_eq!(processing.max_pages_per_pass, 10);
        assert_eq!(processing.open_cycle_timeout(), Some(chrono::Duration::seconds(3600)));
        assert!(!processing.fail_on_plc_flag);
        assert_eq!(default_exclusion_marker(), "tes");
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let processing = ProcessingConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            processing.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_same_photo_dirs_rejected() {
        let photos = PhotoConfig {
            staging_dir: PathBuf::from("/srv/photos"),
            processed_dir: PathBuf::from("/srv/photos"),
            ..Default::default()
        };
        assert!(photos.validate().is_err());
    }

    #[test]
    fn test_plant_offset() {
        let processing = ProcessingConfig {
            plant_utc_offset_minutes: -180,
            ..Default::default()
        };
        assert_eq!(processing.plant_offset().local_minus_utc(), -180 * 60);
    }

    #[test]
    fn test_worker_ids_unique() {
        assert_ne!(default_worker_id(), default_worker_id());
    }
}
