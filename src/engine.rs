//! Alert state machine.
//!
//! [`AlertEngine`] is the single owner of [`EngineState`]. Readings go in
//! through [`AlertEngine::ingest`], which either drops them, leaves the level
//! alone, or commits a transition and returns exactly one [`AlertEvent`].
//! Everything else sees the state only through [`EngineSnapshot`] copies.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::classifier::ThresholdTable;
use crate::defaults;
use crate::error::InputError;
use crate::level::AlertLevel;
use crate::protocol::ID_LEN;
use crate::source::Reading;

/// Emitted once per confirmed level transition. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub alert_id: String,
    pub level: AlertLevel,
    pub previous: AlertLevel,
    pub water_cm: f64,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    /// Human-readable alert text used by SMS and the dashboard.
    pub fn message(&self) -> String {
        if self.level == AlertLevel::Normal {
            format!(
                "FLOOD ALL CLEAR: Water level is {:.0} cm. Previous level: {}.",
                self.water_cm, self.previous
            )
        } else {
            format!(
                "FLOOD ALERT [{}]: Water level is {:.0} cm. Previous level: {}.",
                self.level, self.water_cm, self.previous
            )
        }
    }
}

/// The authoritative engine state.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineState {
    pub current_level: AlertLevel,
    pub last_change_at: DateTime<Utc>,
    /// Id of the transition that produced `current_level`; `None` before the first one
    pub alert_id: Option<String>,
    /// Last classified reading
    pub water_cm: Option<f64>,
    pub confidence: Option<f64>,
}

/// Read-only copy of [`EngineState`] for status surfaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub level: AlertLevel,
    pub water_cm: Option<f64>,
    pub confidence: Option<f64>,
    pub last_change_at: DateTime<Utc>,
    pub alert_id: Option<String>,
}

/// One accepted reading and the level it resolved to, for the level chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingRecord {
    pub timestamp: DateTime<Utc>,
    pub water_cm: f64,
    pub confidence: f64,
    pub level: AlertLevel,
}

/// Hysteresis classifier + state machine.
pub struct AlertEngine {
    thresholds: ThresholdTable,
    min_confidence: f64,
    state: EngineState,
    history: VecDeque<AlertEvent>,
    history_len: usize,
    readings: VecDeque<ReadingRecord>,
    readings_len: usize,
    dropped: u64,
}

impl AlertEngine {
    pub fn new(thresholds: ThresholdTable, min_confidence: f64, history_len: usize) -> Self {
        Self {
            thresholds,
            min_confidence,
            state: EngineState {
                current_level: AlertLevel::Normal,
                last_change_at: Utc::now(),
                alert_id: None,
                water_cm: None,
                confidence: None,
            },
            history: VecDeque::with_capacity(history_len),
            history_len: history_len.max(1),
            readings: VecDeque::new(),
            readings_len: defaults::READING_HISTORY_LEN,
            dropped: 0,
        }
    }

    /// Keep at most `len` accepted readings (at least one).
    pub fn with_reading_history(mut self, len: usize) -> Self {
        self.readings_len = len.max(1);
        while self.readings.len() > self.readings_len {
            self.readings.pop_front();
        }
        self
    }

    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }

    pub fn level(&self) -> AlertLevel {
        self.state.current_level
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            level: self.state.current_level,
            water_cm: self.state.water_cm,
            confidence: self.state.confidence,
            last_change_at: self.state.last_change_at,
            alert_id: self.state.alert_id.clone(),
        }
    }

    /// Alert history, oldest first.
    pub fn history(&self) -> impl DoubleEndedIterator<Item = &AlertEvent> + ExactSizeIterator {
        self.history.iter()
    }

    /// Accepted readings, oldest first. Dropped readings never appear here.
    pub fn readings(&self) -> impl DoubleEndedIterator<Item = &ReadingRecord> + ExactSizeIterator {
        self.readings.iter()
    }

    /// Most recent event, i.e. the one describing the current level.
    pub fn latest_event(&self) -> Option<&AlertEvent> {
        self.history.back()
    }

    /// Readings dropped so far (malformed or low confidence).
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Check a reading before classification.
    pub fn screen(&self, reading: &Reading) -> Result<(), InputError> {
        if !reading.value_cm.is_finite() {
            return Err(InputError::Malformed(format!("value {} is not finite", reading.value_cm)));
        }
        if !(0.0..=1.0).contains(&reading.confidence) {
            return Err(InputError::Malformed(format!(
                "confidence {} outside [0, 1]",
                reading.confidence
            )));
        }
        if reading.confidence < self.min_confidence {
            return Err(InputError::LowConfidence {
                confidence: reading.confidence,
                min: self.min_confidence,
            });
        }
        Ok(())
    }

    /// Classify one reading and commit a transition if the level changed.
    ///
    /// At most one event per call; a multi-level jump resolves to its final
    /// level inside the classifier. Dropped readings leave the state as is.
    pub fn ingest(&mut self, reading: &Reading) -> Option<AlertEvent> {
        if let Err(e) = self.screen(reading) {
            self.dropped += 1;
            match e {
                InputError::LowConfidence { .. } => log::debug!("Reading dropped: {}", e),
                InputError::Malformed(_) => log::warn!("Reading dropped: {}", e),
            }
            return None;
        }

        let previous = self.state.current_level;
        let level = self.thresholds.classify(reading.value_cm, previous);

        // Build the full new state before touching the old one
        let mut next = self.state.clone();
        next.water_cm = Some(reading.value_cm);
        next.confidence = Some(reading.confidence);

        let event = (level != previous).then(|| AlertEvent {
            alert_id: new_alert_id(),
            level,
            previous,
            water_cm: reading.value_cm,
            timestamp: reading.timestamp,
        });
        if let Some(event) = &event {
            next.current_level = level;
            next.last_change_at = event.timestamp;
            next.alert_id = Some(event.alert_id.clone());
        }
        self.state = next;

        if self.readings.len() == self.readings_len {
            self.readings.pop_front();
        }
        self.readings.push_back(ReadingRecord {
            timestamp: reading.timestamp,
            water_cm: reading.value_cm,
            confidence: reading.confidence,
            level: self.state.current_level,
        });

        if let Some(event) = &event {
            log::warn!("{}", event.message());
            if self.history.len() == self.history_len {
                self.history.pop_front();
            }
            self.history.push_back(event.clone());
        }
        event
    }
}

/// Fresh 8-hex-char alert id.
fn new_alert_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(ID_LEN);
    id
}
