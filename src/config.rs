//! TOML service configuration.
//!
//! Every section is optional and falls back to [`crate::defaults`]. A missing
//! config file runs on defaults; a file that exists but does not parse or
//! validate stops the service before any reading is classified.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::classifier::{Band, ThresholdTable};
use crate::defaults;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub thresholds: ThresholdsConfig,
    pub feed: FeedConfig,
    pub status: StatusConfig,
    pub dashboard: DashboardConfig,
    pub sms: SmsConfig,
    pub beacon: BeaconConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Readings below this confidence are dropped
    pub min_confidence: f64,
    pub history_len: usize,
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_confidence: defaults::MIN_CONFIDENCE,
            history_len: defaults::HISTORY_LEN,
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    pub warning: Band,
    pub danger: Band,
    pub critical: Band,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        let [warning, danger, critical] = *defaults::THRESHOLDS.bands();
        Self {
            warning,
            danger,
            critical,
        }
    }
}

impl ThresholdsConfig {
    pub fn table(&self) -> Result<ThresholdTable, ConfigError> {
        Ok(ThresholdTable::validated([self.warning, self.danger, self.critical])?)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// NDJSON reading feed; "-" reads stdin
    pub path: String,
    /// Median window; 0 or 1 disables smoothing
    pub smoothing_window: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            path: "-".into(),
            smoothing_window: defaults::SMOOTHING_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Status JSON file rewritten every tick, if set
    pub path: Option<PathBuf>,
    /// Accepted readings kept for the level chart
    pub reading_history_len: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            path: None,
            reading_history_len: defaults::READING_HISTORY_LEN,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub timeout_ms: u64,
    pub queue_len: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: defaults::DASHBOARD_TIMEOUT_MS,
            queue_len: defaults::DASHBOARD_QUEUE_LEN,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    pub enabled: bool,
    pub program: String,
    /// Arguments placed before the SMS arguments, e.g. a wrapper's own flags
    pub program_args: Vec<String>,
    /// Phone name or id as known to the SMS tool
    pub device: String,
    pub recipients: Vec<String>,
    pub timeout_ms: u64,
    pub reminder_secs: Option<u64>,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: defaults::SMS_PROGRAM.into(),
            program_args: Vec::new(),
            device: String::new(),
            recipients: Vec::new(),
            timeout_ms: defaults::SMS_TIMEOUT_MS,
            reminder_secs: Some(defaults::SMS_REMINDER_SECS),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    pub enabled: bool,
    pub port: String,
    pub baud_rate: u32,
    pub write_timeout_ms: u64,
    /// Dispatcher-side bound for the whole send
    pub timeout_ms: u64,
    pub reminder_secs: Option<u64>,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: defaults::BEACON_PORT.into(),
            baud_rate: defaults::BEACON_BAUD,
            write_timeout_ms: defaults::BEACON_WRITE_TIMEOUT_MS,
            timeout_ms: defaults::BEACON_TIMEOUT_MS,
            reminder_secs: Some(defaults::BEACON_REMINDER_SECS),
        }
    }
}

impl Config {
    /// Load and validate. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!("Config {} not found, using defaults", path.display());
                return Self::default().validated();
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.table()?;

        let min = self.engine.min_confidence;
        if !(0.0..=1.0).contains(&min) {
            return Err(ConfigError::Invalid(format!(
                "engine.min_confidence must be within [0, 1], got {min}"
            )));
        }
        if self.engine.history_len == 0 {
            return Err(ConfigError::Invalid("engine.history_len must be at least 1".into()));
        }
        if self.status.reading_history_len == 0 {
            return Err(ConfigError::Invalid("status.reading_history_len must be at least 1".into()));
        }
        if self.engine.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("engine.poll_interval_ms must be positive".into()));
        }

        let timeouts = [
            ("dashboard.timeout_ms", self.dashboard.enabled, self.dashboard.timeout_ms),
            ("sms.timeout_ms", self.sms.enabled, self.sms.timeout_ms),
            ("beacon.timeout_ms", self.beacon.enabled, self.beacon.timeout_ms),
            ("beacon.write_timeout_ms", self.beacon.enabled, self.beacon.write_timeout_ms),
        ];
        for (name, enabled, value) in timeouts {
            if enabled && value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.dashboard.enabled && self.dashboard.queue_len == 0 {
            return Err(ConfigError::Invalid("dashboard.queue_len must be at least 1".into()));
        }
        for (name, reminder) in [
            ("sms.reminder_secs", self.sms.reminder_secs),
            ("beacon.reminder_secs", self.beacon.reminder_secs),
        ] {
            if reminder == Some(0) {
                return Err(ConfigError::Invalid(format!("{name} must be positive when set")));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.engine.poll_interval_ms)
    }
}
