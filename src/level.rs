/// Ordered flood hazard levels.
///
/// The discriminant is the wire rank (`lvl` in the serial protocol,
/// `alert_level` in the broadcast frame). Ordering follows the rank.
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum AlertLevel {
    #[default]
    Normal = 0,
    Warning = 1,
    Danger = 2,
    Critical = 3,
}

impl AlertLevel {
    /// All levels, lowest first.
    pub const ALL: [AlertLevel; 4] = [
        AlertLevel::Normal,
        AlertLevel::Warning,
        AlertLevel::Danger,
        AlertLevel::Critical,
    ];

    pub const fn rank(self) -> u8 {
        self as u8
    }

    /// Level for a wire rank, `None` above 3.
    pub const fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            0 => Some(AlertLevel::Normal),
            1 => Some(AlertLevel::Warning),
            2 => Some(AlertLevel::Danger),
            3 => Some(AlertLevel::Critical),
            _ => None,
        }
    }

    /// Next level up, saturating at `Critical`.
    pub const fn up(self) -> Self {
        match self {
            AlertLevel::Normal => AlertLevel::Warning,
            AlertLevel::Warning => AlertLevel::Danger,
            AlertLevel::Danger | AlertLevel::Critical => AlertLevel::Critical,
        }
    }

    /// Next level down, saturating at `Normal`.
    pub const fn down(self) -> Self {
        match self {
            AlertLevel::Normal | AlertLevel::Warning => AlertLevel::Normal,
            AlertLevel::Danger => AlertLevel::Warning,
            AlertLevel::Critical => AlertLevel::Danger,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            AlertLevel::Normal => "NORMAL",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Danger => "DANGER",
            AlertLevel::Critical => "CRITICAL",
        }
    }

    /// Dashboard color (CSS hex).
    pub const fn color(self) -> &'static str {
        match self {
            AlertLevel::Normal => "#22c55e",
            AlertLevel::Warning => "#eab308",
            AlertLevel::Danger => "#f97316",
            AlertLevel::Critical => "#ef4444",
        }
    }
}

impl core::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}
