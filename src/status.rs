//! Read-only status surface.
//!
//! The monitor publishes a fresh [`StatusReport`] after every tick; readers
//! (dashboard, status file) only ever get clones.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::classifier::{Band, ThresholdTable};
use crate::dispatch::DispatchReport;
use crate::engine::{AlertEvent, EngineSnapshot, ReadingRecord};
use crate::serial::DeviceReport;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdView {
    pub warning: Band,
    pub danger: Band,
    pub critical: Band,
}

impl From<&ThresholdTable> for ThresholdView {
    fn from(table: &ThresholdTable) -> Self {
        let [warning, danger, critical] = *table.bands();
        Self {
            warning,
            danger,
            critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelLiveness {
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub updated_at: DateTime<Utc>,
    pub engine: EngineSnapshot,
    pub level_name: &'static str,
    pub color: &'static str,
    pub thresholds: ThresholdView,
    pub channels: Vec<ChannelLiveness>,
    pub last_dispatch: Option<DispatchReport>,
    /// Newest first
    pub history: Vec<AlertEvent>,
    /// Accepted readings for the level chart, oldest first
    pub readings: Vec<ReadingRecord>,
    pub beacon_device: Option<DeviceReport>,
    pub dropped_readings: u64,
}

/// Shared, latest-wins status holder.
#[derive(Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<Option<StatusReport>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, report: StatusReport) {
        let mut slot = self.inner.write().unwrap_or_else(|p| p.into_inner());
        *slot = Some(report);
    }

    /// Latest report, `None` before the first tick.
    pub fn snapshot(&self) -> Option<StatusReport> {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Write `report` as pretty JSON, replacing `path` atomically.
pub fn write_status_file(path: &Path, report: &StatusReport) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "status path has no file name"))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));
    let json = serde_json::to_vec_pretty(report)?;
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}
