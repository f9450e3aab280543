//! trendsrv configuration
//!
//! Layering: built-in defaults, then `config/trendsrv.yaml` (or the path
//! given on the command line), then `TRENDSRV_` environment variables.
//! Nested keys use a double underscore: `TRENDSRV_DEVICE__ADDRESS`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrendSrvError};

pub const DEFAULT_CONFIG_PATH: &str = "config/trendsrv.yaml";
pub const ENV_PREFIX: &str = "TRENDSRV_";

/// Controller CPU family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuType {
    S7200,
    S7300,
    S7400,
    S71200,
    S71500,
}

/// Device link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Client implementation; only `virtual` is built in
    pub driver: String,
    pub address: String,
    pub port: u16,
    pub rack: u16,
    pub slot: u16,
    pub cpu_type: CpuType,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            driver: "virtual".to_string(),
            address: "192.168.0.1".to_string(),
            port: 102,
            rack: 0,
            slot: 1,
            cpu_type: CpuType::S71500,
            connect_timeout_ms: 5000,
            read_timeout_ms: 2000,
            reconnect_delay_ms: 5000,
            max_reconnect_attempts: 10,
        }
    }
}

impl DeviceConfig {
    pub fn endpoint(&self) -> String {
        format!(
            "{}:{} rack={} slot={}",
            self.address, self.port, self.rack, self.slot
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Polling loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    /// Rows per multi-row INSERT
    pub batch_size: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            batch_size: 50,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Retention horizons and cleanup cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub raw_data_retention_days: u32,
    pub hourly_aggregate_retention_days: u32,
    pub daily_aggregate_retention_days: u32,
    pub cleanup_interval_hours: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_data_retention_days: 7,
            hourly_aggregate_retention_days: 30,
            daily_aggregate_retention_days: 365,
            cleanup_interval_hours: 1,
        }
    }
}

impl RetentionConfig {
    pub fn raw_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.raw_data_retention_days))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.cleanup_interval_hours) * 3600)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/trendsrv.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Daily-rolling log files are written here when set
    pub dir: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub polling: PollingConfig,
    pub retention: RetentionConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Layered figment for `path` (default location when `None`)
    pub fn figment(path: Option<&Path>) -> Figment {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration; a missing file leaves defaults in place
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::figment(path)
            .extract()
            .map_err(|e| TrendSrvError::config(format!("Failed to load configuration: {}", e)))
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> Result<()> {
        let device = &self.device;
        if device.address.trim().is_empty() {
            return Err(TrendSrvError::config("device.address cannot be empty"));
        }
        if device.port == 0 {
            return Err(TrendSrvError::config("device.port cannot be 0"));
        }
        if device.connect_timeout_ms == 0 || device.read_timeout_ms == 0 {
            return Err(TrendSrvError::config(
                "device connect and read timeouts must be greater than 0",
            ));
        }
        if device.max_reconnect_attempts == 0 {
            return Err(TrendSrvError::config(
                "device.max_reconnect_attempts must be greater than 0",
            ));
        }
        if device.driver != "virtual" {
            return Err(TrendSrvError::config(format!(
                "Unknown device driver '{}' (available: virtual)",
                device.driver
            )));
        }

        if self.polling.interval_ms == 0 {
            return Err(TrendSrvError::config("polling.interval_ms must be greater than 0"));
        }
        if self.polling.batch_size == 0 {
            return Err(TrendSrvError::config("polling.batch_size must be greater than 0"));
        }

        let retention = &self.retention;
        if retention.raw_data_retention_days == 0 {
            return Err(TrendSrvError::config(
                "retention.raw_data_retention_days must be greater than 0",
            ));
        }
        if retention.cleanup_interval_hours == 0 {
            return Err(TrendSrvError::config(
                "retention.cleanup_interval_hours must be greater than 0",
            ));
        }
        if retention.hourly_aggregate_retention_days < retention.raw_data_retention_days
            || retention.daily_aggregate_retention_days < retention.hourly_aggregate_retention_days
        {
            return Err(TrendSrvError::config(
                "aggregate retention horizons must not be shorter than the raw horizon",
            ));
        }

        if self.database.path.as_os_str().is_empty() {
            return Err(TrendSrvError::config("database.path cannot be empty"));
        }
        Ok(())
    }
}
