/// Wire formats between the host, the beacon device and the mesh.
///
/// - Host → device: one JSON object per line ([`BeaconMessage`]).
/// - Device → host: NDJSON informational lines ([`DeviceMessage`]).
/// - Device → mesh: 8-byte manufacturer-data frame ([`BeaconFrame`]) plus a
///   human-readable advertising name for scanners that don't know the frame.
///
/// Uses `heapless` types for no_std/no-alloc operation.
use core::fmt::Write;

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::level::AlertLevel;

/// Alert id as carried on the wire. Eight chars is the norm; a little slack
/// is accepted so a longer id still decodes instead of being dropped.
pub type IdString = String<16>;

/// Length of the id the host puts on the wire.
pub const ID_LEN: usize = 8;

/// Maximum content length of one line-protocol message, line terminator
/// excluded. Receivers accept exactly this many bytes before the newline;
/// encoders stay one byte under so the terminated line fits a [`LineBuffer`].
pub const MAX_LINE_LEN: usize = 256;

/// Buffer type for one serialized line.
pub type LineBuffer = Vec<u8, MAX_LINE_LEN>;

/// Idle time after the last valid message before the device stops advertising.
pub const IDLE_TIMEOUT_MS: u64 = 30_000;

/// Company id prefixed to the frame in manufacturer data (0xFFFF is the
/// Bluetooth SIG value reserved for testing / unregistered use).
pub const MANUFACTURER_ID: u16 = 0xFFFF;

/// Size of [`BeaconFrame`] on air.
pub const FRAME_LEN: usize = 8;

/// Bytes left for the advertising name once flags and manufacturer data are
/// in the 31-byte legacy advertising payload.
pub const ADV_NAME_BUDGET: usize = 14;

/// Advertising name, e.g. `FLOOD-L3-285cm`.
pub type AdvName = String<24>;

/// Firmware / library version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Host → device alert message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconMessage {
    /// Alert level rank, 0..=3
    pub lvl: u8,
    /// Water level in whole centimetres
    pub cm: u16,
    /// Alert id (dedup token)
    pub id: IdString,
    /// Unix epoch seconds at the host
    pub ts: u32,
}

impl BeaconMessage {
    pub fn level(&self) -> Option<AlertLevel> {
        AlertLevel::from_rank(self.lvl)
    }
}

/// Why a line from the host was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Blank line
    Empty,
    /// Not a valid message object
    Malformed,
    /// `lvl` outside 0..=3
    LevelOutOfRange(u8),
    /// Line exceeded [`MAX_LINE_LEN`] and was discarded
    LineTooLong,
}

impl ProtocolError {
    /// Short reason code used in device error reports.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProtocolError::Empty => "empty",
            ProtocolError::Malformed => "malformed",
            ProtocolError::LevelOutOfRange(_) => "level_out_of_range",
            ProtocolError::LineTooLong => "line_too_long",
        }
    }
}

impl core::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProtocolError::Empty => f.write_str("empty line"),
            ProtocolError::Malformed => f.write_str("malformed message"),
            ProtocolError::LevelOutOfRange(lvl) => write!(f, "level {lvl} out of range"),
            ProtocolError::LineTooLong => write!(f, "line longer than {MAX_LINE_LEN} bytes"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ProtocolError {}

// ── Dedup hash ─────────────────────────────────────────────────────────

/// Polynomial string hash (base 31, wrapping u32) of an alert id, big-endian.
///
/// Relaying phones use these 4 bytes to recognise the same alert without
/// shared state, so the derivation must stay bit-for-bit stable. Not
/// collision resistant.
pub fn dedup_hash(id: &str) -> [u8; 4] {
    let mut h: u32 = 0;
    for b in id.bytes() {
        h = h.wrapping_mul(31).wrapping_add(b as u32);
    }
    h.to_be_bytes()
}

// ── Broadcast frame ────────────────────────────────────────────────────

/// 8-byte mesh frame:
/// `alert_level | water_cm_hi | water_cm_lo | hop_count | msg_id_hash[4]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconFrame {
    pub alert_level: u8,
    pub water_cm: u16,
    /// Always 0 when originated by the beacon; relays increment it.
    pub hop_count: u8,
    pub msg_id_hash: [u8; 4],
}

impl BeaconFrame {
    pub fn from_message(msg: &BeaconMessage) -> Self {
        Self {
            alert_level: msg.lvl,
            water_cm: msg.cm,
            hop_count: 0,
            msg_id_hash: dedup_hash(&msg.id),
        }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_LEN] {
        let cm = self.water_cm.to_be_bytes();
        let h = self.msg_id_hash;
        [self.alert_level, cm[0], cm[1], self.hop_count, h[0], h[1], h[2], h[3]]
    }

    /// Decode a frame as seen by a scanner. `None` if too short.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < FRAME_LEN {
            return None;
        }
        Some(Self {
            alert_level: data[0],
            water_cm: u16::from_be_bytes([data[1], data[2]]),
            hop_count: data[3],
            msg_id_hash: [data[4], data[5], data[6], data[7]],
        })
    }

    /// Manufacturer-data payload: little-endian company id, then the frame.
    pub fn manufacturer_data(&self) -> [u8; FRAME_LEN + 2] {
        let mut out = [0u8; FRAME_LEN + 2];
        out[..2].copy_from_slice(&MANUFACTURER_ID.to_le_bytes());
        out[2..].copy_from_slice(&self.to_bytes());
        out
    }
}

/// Human-readable advertising name `FLOOD-L{level}-{cm}cm`.
pub fn adv_name(level: u8, cm: u16) -> AdvName {
    let mut name = AdvName::new();
    // Longest form "FLOOD-L255-65535cm" is 18 chars, fits
    let _ = write!(name, "FLOOD-L{}-{}cm", level, cm);
    name
}

// ── Device → host reports ──────────────────────────────────────────────

/// Informational lines sent from the beacon device back to the host.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum DeviceMessage<'a> {
    /// A valid message was applied
    #[serde(rename = "ack")]
    Ack {
        lvl: u8,
        cm: u16,
        id: &'a str,
        /// "normal" or "advertising"
        state: &'static str,
    },
    /// A line was rejected
    #[serde(rename = "error")]
    Error { reason: &'static str },
    /// Advertising stopped after the idle timeout
    #[serde(rename = "expired")]
    Expired { lvl: u8, id: &'a str },
    /// Radio refused a start/stop
    #[serde(rename = "radio_fault")]
    RadioFault { op: &'static str },
    /// Periodic / boot status
    #[serde(rename = "status")]
    Status {
        state: &'static str,
        lvl: u8,
        /// Uptime in seconds
        uptime: u32,
        accepted: u32,
        rejected: u32,
        board: &'static str,
        version: &'static str,
    },
}
