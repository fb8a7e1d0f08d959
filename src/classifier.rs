/// Hysteresis classifier: water level (cm) → [`AlertLevel`].
///
/// Each level above NORMAL has a rising threshold (escalate when the value
/// reaches it) and a lower falling threshold (de-escalate only when the value
/// drops below it). The band between the two absorbs jitter so a reading
/// sitting on a boundary cannot flap the level.
use serde::{Deserialize, Serialize};

use crate::level::AlertLevel;

/// Rising / falling pair for one level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub rising: f64,
    pub falling: f64,
}

/// Bands for WARNING, DANGER and CRITICAL, in that order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdTable {
    bands: [Band; 3],
}

/// Why a threshold table was rejected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdError {
    /// A threshold is NaN or infinite.
    NotFinite(AlertLevel),
    /// Rising threshold is not above the previous level's rising threshold.
    RisingNotIncreasing(AlertLevel),
    /// Falling threshold is not strictly below the rising one.
    NoHysteresisBand(AlertLevel),
    /// Falling threshold dips below the previous level's rising threshold.
    FallingBelowPrevious(AlertLevel),
}

impl core::fmt::Display for ThresholdError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ThresholdError::NotFinite(l) => write!(f, "{l}: threshold is not a finite number"),
            ThresholdError::RisingNotIncreasing(l) => {
                write!(f, "{l}: rising threshold must be above the previous level's")
            }
            ThresholdError::NoHysteresisBand(l) => {
                write!(f, "{l}: falling threshold must be below the rising threshold")
            }
            ThresholdError::FallingBelowPrevious(l) => {
                write!(f, "{l}: falling threshold must not be below the previous level's rising threshold")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ThresholdError {}

impl ThresholdTable {
    /// Build a table without validation. Use [`ThresholdTable::validated`]
    /// for anything that comes from configuration.
    pub const fn new(bands: [Band; 3]) -> Self {
        Self { bands }
    }

    /// Build and validate a table.
    pub fn validated(bands: [Band; 3]) -> Result<Self, ThresholdError> {
        let table = Self { bands };
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<(), ThresholdError> {
        let mut prev_rising: Option<f64> = None;
        for (i, band) in self.bands.iter().enumerate() {
            let level = AlertLevel::ALL[i + 1];
            if !band.rising.is_finite() || !band.falling.is_finite() {
                return Err(ThresholdError::NotFinite(level));
            }
            if band.falling >= band.rising {
                return Err(ThresholdError::NoHysteresisBand(level));
            }
            if let Some(prev) = prev_rising {
                if band.rising <= prev {
                    return Err(ThresholdError::RisingNotIncreasing(level));
                }
                if band.falling < prev {
                    return Err(ThresholdError::FallingBelowPrevious(level));
                }
            }
            prev_rising = Some(band.rising);
        }
        Ok(())
    }

    /// Band for a level above NORMAL. NORMAL has no band.
    pub fn band(&self, level: AlertLevel) -> Option<&Band> {
        match level {
            AlertLevel::Normal => None,
            other => self.bands.get(other.rank() as usize - 1),
        }
    }

    pub fn bands(&self) -> &[Band; 3] {
        &self.bands
    }

    /// Classify a value given the currently confirmed level.
    ///
    /// Walks up one level at a time while the next rising threshold is met,
    /// so a single reading can jump several levels. If nothing escalates,
    /// walks down one level at a time while the value is below the current
    /// level's falling threshold. Non-finite values keep `current`.
    pub fn classify(&self, value_cm: f64, current: AlertLevel) -> AlertLevel {
        let mut level = current;

        while level < AlertLevel::Critical {
            match self.band(level.up()) {
                Some(next) if value_cm >= next.rising => level = level.up(),
                _ => break,
            }
        }
        if level != current {
            return level;
        }

        while let Some(band) = self.band(level) {
            if value_cm < band.falling {
                level = level.down();
            } else {
                break;
            }
        }
        level
    }
}

/// Free-function form of [`ThresholdTable::classify`].
pub fn classify(table: &ThresholdTable, value_cm: f64, current: AlertLevel) -> AlertLevel {
    table.classify(value_cm, current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::THRESHOLDS;
    use AlertLevel::*;

    fn walk(values: &[f64]) -> heapless::Vec<AlertLevel, 16> {
        let mut level = Normal;
        let mut out = heapless::Vec::new();
        for &v in values {
            level = THRESHOLDS.classify(v, level);
            let _ = out.push(level);
        }
        out
    }

    // ── Escalation ──────────────────────────────────────────────────

    #[test]
    fn escalates_to_level_whose_rising_threshold_was_crossed() {
        assert_eq!(THRESHOLDS.classify(219.9, Normal), Normal);
        assert_eq!(THRESHOLDS.classify(220.0, Normal), Warning);
        assert_eq!(THRESHOLDS.classify(259.9, Normal), Warning);
        assert_eq!(THRESHOLDS.classify(260.0, Normal), Danger);
        assert_eq!(THRESHOLDS.classify(289.0, Normal), Danger);
        assert_eq!(THRESHOLDS.classify(290.0, Normal), Critical);
        assert_eq!(THRESHOLDS.classify(1000.0, Normal), Critical);
    }

    #[test]
    fn multi_level_jump_in_one_reading() {
        assert_eq!(THRESHOLDS.classify(300.0, Normal), Critical);
        assert_eq!(THRESHOLDS.classify(270.0, Warning), Danger);
    }

    // ── Hysteresis ──────────────────────────────────────────────────

    #[test]
    fn hysteresis_holds_inside_band() {
        assert_eq!(walk(&[225.0, 205.0, 225.0]).as_slice(), &[Warning, Warning, Warning]);
        assert_eq!(THRESHOLDS.classify(200.0, Warning), Warning);
        assert_eq!(THRESHOLDS.classify(199.9, Warning), Normal);
    }

    #[test]
    fn de_escalation_requires_clearing_falling_threshold() {
        // Below DANGER rising (260) but above its falling (240): stays DANGER
        assert_eq!(THRESHOLDS.classify(245.0, Danger), Danger);
        assert_eq!(THRESHOLDS.classify(239.0, Danger), Warning);
    }

    #[test]
    fn multi_level_drop_stops_at_first_satisfied_falling_threshold() {
        assert_eq!(THRESHOLDS.classify(100.0, Critical), Normal);
        assert_eq!(THRESHOLDS.classify(230.0, Critical), Warning);
        assert_eq!(THRESHOLDS.classify(265.0, Critical), Danger);
    }

    #[test]
    fn full_cycle_sequence() {
        assert_eq!(
            walk(&[100.0, 225.0, 265.0, 300.0, 100.0]).as_slice(),
            &[Normal, Warning, Danger, Critical, Normal]
        );
    }

    #[test]
    fn nan_keeps_current_level() {
        assert_eq!(THRESHOLDS.classify(f64::NAN, Danger), Danger);
        assert_eq!(classify(&THRESHOLDS, f64::NAN, Normal), Normal);
    }

    // ── Validation ──────────────────────────────────────────────────

    #[test]
    fn default_table_is_valid() {
        assert_eq!(THRESHOLDS.validate(), Ok(()));
    }

    #[test]
    fn rejects_non_increasing_rising() {
        let err = ThresholdTable::validated([
            Band { rising: 220.0, falling: 200.0 },
            Band { rising: 220.0, falling: 215.0 },
            Band { rising: 290.0, falling: 270.0 },
        ])
        .unwrap_err();
        assert_eq!(err, ThresholdError::RisingNotIncreasing(Danger));
    }

    #[test]
    fn rejects_missing_hysteresis_band() {
        let err = ThresholdTable::validated([
            Band { rising: 220.0, falling: 220.0 },
            Band { rising: 260.0, falling: 240.0 },
            Band { rising: 290.0, falling: 270.0 },
        ])
        .unwrap_err();
        assert_eq!(err, ThresholdError::NoHysteresisBand(Warning));
    }

    #[test]
    fn rejects_falling_below_previous_rising() {
        let err = ThresholdTable::validated([
            Band { rising: 220.0, falling: 200.0 },
            Band { rising: 260.0, falling: 210.0 },
            Band { rising: 290.0, falling: 270.0 },
        ])
        .unwrap_err();
        assert_eq!(err, ThresholdError::FallingBelowPrevious(Danger));
    }

    #[test]
    fn rejects_non_finite() {
        let err = ThresholdTable::validated([
            Band { rising: 220.0, falling: 200.0 },
            Band { rising: 260.0, falling: 240.0 },
            Band { rising: f64::INFINITY, falling: 270.0 },
        ])
        .unwrap_err();
        assert_eq!(err, ThresholdError::NotFinite(Critical));
    }
}
