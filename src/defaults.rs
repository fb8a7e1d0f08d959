/// Default configuration values.
///
/// Threshold values are calibrated for a 3 m staff gauge read by the
/// camera pipeline. Every value here can be overridden in the TOML config.
use crate::classifier::{Band, ThresholdTable};

/// Rising / falling thresholds (cm) for WARNING, DANGER, CRITICAL.
pub const THRESHOLDS: ThresholdTable = ThresholdTable::new([
    Band { rising: 220.0, falling: 200.0 },
    Band { rising: 260.0, falling: 240.0 },
    Band { rising: 290.0, falling: 270.0 },
]);

/// Readings with confidence below this are dropped before classification.
pub const MIN_CONFIDENCE: f64 = 0.5;

/// Number of alert events kept for display.
pub const HISTORY_LEN: usize = 100;

/// Entries of history shown on the status surface.
pub const STATUS_HISTORY_LEN: usize = 10;

/// Accepted readings kept for the water-level chart.
pub const READING_HISTORY_LEN: usize = 200;

/// Monitor loop period.
pub const POLL_INTERVAL_MS: u64 = 500;

/// Temporal median window over accepted readings.
pub const SMOOTHING_WINDOW: usize = 5;

// ── Channels ─────────────────────────────────────────────────────────

pub const DASHBOARD_TIMEOUT_MS: u64 = 1_000;
pub const DASHBOARD_QUEUE_LEN: usize = 32;

pub const SMS_PROGRAM: &str = "kdeconnect-cli";
/// Per-invocation timeout of the SMS tool.
pub const SMS_TIMEOUT_MS: u64 = 15_000;
pub const SMS_REMINDER_SECS: u64 = 300;

pub const BEACON_PORT: &str = "/dev/ttyUSB0";
/// Must match the firmware console rate.
pub const BEACON_BAUD: u32 = crate::comm::SERIAL_BAUD;
pub const BEACON_WRITE_TIMEOUT_MS: u64 = 2_000;
pub const BEACON_TIMEOUT_MS: u64 = 3_000;
/// Must stay well under the device idle timeout or live alerts expire.
pub const BEACON_REMINDER_SECS: u64 = 10;
